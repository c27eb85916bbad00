//! Decoration: capability sets applied to vertices and edges.
//!
//! A decorator is a named bundle of attribute entries contributed by a
//! model component's objects. Applying a decorator merges its attributes
//! into the target and records the decorator name, subject to three rules:
//! required precursor decorators must already be applied, the same
//! decorator cannot be applied twice, and an attribute-name collision
//! needs an explicit resolution callback or the application fails.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Callback resolving an attribute collision: receives the attribute name,
/// the existing value, and the incoming value, and returns the value to
/// keep.
pub type ConflictHandler =
    dyn Fn(&str, &serde_json::Value, &serde_json::Value) -> serde_json::Value + Send + Sync;

/// A named capability bundle.
#[derive(Clone, Debug, Default)]
pub struct Decorator {
    /// Decorator name, unique within its component's object set.
    pub name: String,
    /// Names of decorators that must already be applied to the target.
    pub requires: Vec<String>,
    /// Attribute entries merged into the target on application.
    pub attributes: FxHashMap<String, serde_json::Value>,
}

impl Decorator {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn requires(mut self, precursor: impl Into<String>) -> Self {
        self.requires.push(precursor.into());
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Errors raised when applying a decorator.
#[derive(Debug, Error, Diagnostic)]
pub enum DecoratorError {
    #[error("decorator \"{decorator}\" is already applied")]
    #[diagnostic(code(embermesh::decorate::already_applied))]
    AlreadyApplied { decorator: String },

    #[error("decorator \"{decorator}\" requires \"{precursor}\" to be applied first")]
    #[diagnostic(
        code(embermesh::decorate::missing_precursor),
        help("Apply the required precursor decorator before this one.")
    )]
    MissingPrecursor {
        decorator: String,
        precursor: String,
    },

    #[error("decorator \"{decorator}\" collides on attribute \"{attribute}\"")]
    #[diagnostic(
        code(embermesh::decorate::name_collision),
        help("Pass a conflict handler to decide which value wins.")
    )]
    NameCollision {
        decorator: String,
        attribute: String,
    },
}

/// Which decorators have been applied to a target.
#[derive(Clone, Debug, Default)]
pub struct DecorationState {
    applied: Vec<String>,
}

impl DecorationState {
    /// Whether `decorator` has been applied.
    #[must_use]
    pub fn is_decorated_by(&self, decorator: &str) -> bool {
        self.applied.iter().any(|name| name == decorator)
    }

    /// Applied decorator names in application order.
    #[must_use]
    pub fn applied(&self) -> &[String] {
        &self.applied
    }

    /// Apply `decorator`, merging its attributes into `attributes`.
    ///
    /// `on_conflict` resolves attribute-name collisions; without one a
    /// collision is fatal. Keys are merged in sorted order so collision
    /// reporting is deterministic.
    pub fn apply(
        &mut self,
        decorator: &Decorator,
        attributes: &mut FxHashMap<String, serde_json::Value>,
        on_conflict: Option<&ConflictHandler>,
    ) -> Result<(), DecoratorError> {
        if self.is_decorated_by(&decorator.name) {
            return Err(DecoratorError::AlreadyApplied {
                decorator: decorator.name.clone(),
            });
        }
        for precursor in &decorator.requires {
            if !self.is_decorated_by(precursor) {
                return Err(DecoratorError::MissingPrecursor {
                    decorator: decorator.name.clone(),
                    precursor: precursor.clone(),
                });
            }
        }

        let mut keys: Vec<&String> = decorator.attributes.keys().collect();
        keys.sort();
        for key in keys {
            let incoming = &decorator.attributes[key];
            match attributes.get(key) {
                Some(existing) => {
                    let Some(handler) = on_conflict else {
                        return Err(DecoratorError::NameCollision {
                            decorator: decorator.name.clone(),
                            attribute: key.clone(),
                        });
                    };
                    let resolved = handler(key, existing, incoming);
                    attributes.insert(key.clone(), resolved);
                }
                None => {
                    attributes.insert(key.clone(), incoming.clone());
                }
            }
        }

        self.applied.push(decorator.name.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn apply_merges_attributes() {
        let mut state = DecorationState::default();
        let mut attrs = FxHashMap::default();
        let decorator = Decorator::named("vm").with_attribute("memory_mb", json!(2048));
        state.apply(&decorator, &mut attrs, None).unwrap();
        assert!(state.is_decorated_by("vm"));
        assert_eq!(attrs["memory_mb"], json!(2048));
    }

    #[test]
    fn double_decoration_is_fatal() {
        let mut state = DecorationState::default();
        let mut attrs = FxHashMap::default();
        let decorator = Decorator::named("vm");
        state.apply(&decorator, &mut attrs, None).unwrap();
        assert!(matches!(
            state.apply(&decorator, &mut attrs, None),
            Err(DecoratorError::AlreadyApplied { .. })
        ));
    }

    #[test]
    fn precursor_is_enforced() {
        let mut state = DecorationState::default();
        let mut attrs = FxHashMap::default();
        let router = Decorator::named("router").requires("vm");
        assert!(matches!(
            state.apply(&router, &mut attrs, None),
            Err(DecoratorError::MissingPrecursor { .. })
        ));

        state.apply(&Decorator::named("vm"), &mut attrs, None).unwrap();
        state.apply(&router, &mut attrs, None).unwrap();
        assert_eq!(state.applied(), ["vm", "router"]);
    }

    #[test]
    fn collision_without_handler_is_fatal() {
        let mut state = DecorationState::default();
        let mut attrs = FxHashMap::default();
        state
            .apply(
                &Decorator::named("base").with_attribute("os", json!("linux")),
                &mut attrs,
                None,
            )
            .unwrap();
        let windows = Decorator::named("windows").with_attribute("os", json!("windows"));
        assert!(matches!(
            state.apply(&windows, &mut attrs, None),
            Err(DecoratorError::NameCollision { .. })
        ));
    }

    #[test]
    fn collision_with_handler_resolves() {
        let mut state = DecorationState::default();
        let mut attrs = FxHashMap::default();
        state
            .apply(
                &Decorator::named("base").with_attribute("os", json!("linux")),
                &mut attrs,
                None,
            )
            .unwrap();
        let windows = Decorator::named("windows").with_attribute("os", json!("windows"));
        let keep_incoming: Box<ConflictHandler> =
            Box::new(|_, _, incoming| incoming.clone());
        state
            .apply(&windows, &mut attrs, Some(keep_incoming.as_ref()))
            .unwrap();
        assert_eq!(attrs["os"], json!("windows"));
    }
}
