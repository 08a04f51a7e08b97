use std::path::Path;

use tempfile::TempDir;
use tracing::{debug, error};

use crate::error::{PolicydError, PolicydResult};

/// Per-case scratch state. The scratch directory is removed when the
/// context is released or dropped, whichever comes first.
#[derive(Debug)]
pub struct TestContext {
    case: String,
    scratch: TempDir,
}

impl TestContext {
    pub fn new(case: &str) -> PolicydResult<Self> {
        let scratch = tempfile::Builder::new()
            .prefix("policyd-")
            .tempdir()
            .map_err(|err| PolicydError::build(format!("failed to create scratch dir: {}", err)))?;
        debug!(case = case, scratch = %scratch.path().display(), "test context created");
        Ok(Self {
            case: case.to_string(),
            scratch,
        })
    }

    pub fn case(&self) -> &str {
        &self.case
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Removes the scratch directory, logging rather than failing the case
    /// when cleanup goes wrong.
    pub fn release(self) {
        let path = self.scratch.path().display().to_string();
        if let Err(err) = self.scratch.close() {
            error!(case = %self.case, scratch = %path, error = %err, "removing scratch dir failed");
        }
    }
}
