//! Experiment timing: the launch timestamp and the synchronized start
//! barrier.
//!
//! Different callers may propose different start times, but every reader
//! observes one consistent value: the first successful write wins at the
//! service and all later proposals converge to it. The proposed time is
//! "now" plus a configurable buffer so distributed agents have slack to
//! enter the running state together; agents therefore wait *at least*
//! the residual buffer, never less.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};

use super::client::{ClientError, CoordinationClient};

/// Timing interface over the coordination client.
///
/// Timestamps are stored with one-second resolution.
#[derive(Clone)]
pub struct ExperimentTiming {
    client: Arc<CoordinationClient>,
    start_buffer_secs: i64,
}

impl ExperimentTiming {
    #[must_use]
    pub fn new(client: Arc<CoordinationClient>, start_buffer_secs: i64) -> Self {
        Self {
            client,
            start_buffer_secs,
        }
    }

    /// Propose a start time of now plus the buffer.
    ///
    /// Idempotent: if a start time already exists it is returned
    /// unchanged, and concurrent proposals all read back the winning
    /// value.
    pub async fn add_start_time(&self) -> Result<DateTime<Utc>, ClientError> {
        if let Some(existing) = self.get_start_time().await? {
            return Ok(existing);
        }
        let proposed =
            (Utc::now() + chrono::Duration::seconds(self.start_buffer_secs)).trunc_subsecs(0);
        let winner = self.client.set_experiment_start_time(proposed).await?;
        tracing::info!(start_time = %winner, "experiment start time recorded");
        Ok(winner)
    }

    /// The consistent start time, or `None` before any proposal.
    pub async fn get_start_time(&self) -> Result<Option<DateTime<Utc>>, ClientError> {
        self.client.get_experiment_start_time().await
    }

    /// Record "now" as the experiment launch time.
    pub async fn set_launch_time(&self) -> Result<DateTime<Utc>, ClientError> {
        let now = Utc::now().trunc_subsecs(0);
        self.client.set_experiment_launch_time(now).await
    }

    /// The recorded launch time, or `None` before launch.
    pub async fn get_launch_time(&self) -> Result<Option<DateTime<Utc>>, ClientError> {
        self.client.get_experiment_launch_time().await
    }

    /// Seconds from launch to the start barrier, once both are known.
    pub async fn time_to_start(&self) -> Result<Option<f64>, ClientError> {
        let (Some(launch), Some(start)) =
            (self.get_launch_time().await?, self.get_start_time().await?)
        else {
            return Ok(None);
        };
        let delta = (start - launch).num_milliseconds() as f64 / 1000.0;
        tracing::debug!(seconds = delta, "time between launch and start");
        Ok(Some(delta))
    }

    /// Seconds elapsed since the start barrier, once it is set.
    pub async fn time_since_start(&self) -> Result<Option<f64>, ClientError> {
        let Some(start) = self.get_start_time().await? else {
            return Ok(None);
        };
        let delta = (Utc::now() - start).num_milliseconds() as f64 / 1000.0;
        Ok(Some(delta))
    }

    /// Clear the start time; the barrier is unset until the next
    /// [`add_start_time`](Self::add_start_time).
    pub async fn clear_start_time(&self) -> Result<(), ClientError> {
        tracing::info!("clearing experiment start time");
        self.client.initialize_experiment_start_time().await
    }
}
