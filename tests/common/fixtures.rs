use std::path::{Path, PathBuf};

use embermesh::manifests::RepositoryIndex;

/// Write a component MANIFEST under `<root>/<dir_name>/MANIFEST`.
pub fn write_manifest(
    root: &Path,
    dir_name: &str,
    name: &str,
    depends: &[&str],
    provides: &[&str],
    mc_depends: &[&str],
) -> PathBuf {
    let dir = root.join(dir_name);
    std::fs::create_dir_all(&dir).unwrap();
    let mut manifest = format!("name: {name}\nattributes:\n");
    manifest.push_str(&yaml_list("  depends", depends));
    manifest.push_str(&yaml_list("  provides", provides));
    manifest.push_str("model_components:\n");
    manifest.push_str(&yaml_list("  depends", mc_depends));
    std::fs::write(dir.join("MANIFEST"), manifest).unwrap();
    dir
}

fn yaml_list(key: &str, items: &[&str]) -> String {
    if items.is_empty() {
        format!("{key}: []\n")
    } else {
        let rendered: Vec<String> = items.iter().map(|item| format!("\"{item}\"")).collect();
        format!("{key}: [{}]\n", rendered.join(", "))
    }
}

/// A repository index file inside `base`, pointing at `repo_root`.
pub fn index_with_repo(base: &Path, repo_root: &Path) -> RepositoryIndex {
    let index = RepositoryIndex::open(base.join("repositories.json")).unwrap();
    index.add(repo_root).unwrap();
    index
}
