//! Process-level runtime handed to the controller.

use kel_cluster::NodeRuntime;
use std::path::PathBuf;
use tracing::info;

/// The real thing: closes the log database directory handle, stops the
/// worker pool, and terminates the process. Tests substitute recording
/// implementations of [`NodeRuntime`] instead.
pub struct ProcessRuntime {
    data_dir: PathBuf,
}

impl ProcessRuntime {
    #[must_use]
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }
}

impl NodeRuntime for ProcessRuntime {
    fn close_database(&self) {
        info!(
            target: "keel::runtime",
            data_dir = %self.data_dir.display(),
            "Closing log database"
        );
    }

    fn stop_workers(&self) {
        info!(target: "keel::runtime", "Stopping worker pool");
    }

    fn exit_process(&self, success: bool) {
        let code = i32::from(!success);
        info!(target: "keel::runtime", code, "Exiting process");
        std::process::exit(code);
    }
}
