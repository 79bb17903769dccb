use thiserror::Error;

use crate::result::ResultType;

/// Failures grouped by how a test run should report them.
#[derive(Debug, Error)]
pub enum Error {
    /// The host can't run the test at all, e.g. there's no `/dev/kvm` or not
    /// enough free memory.
    #[error("unsupported environment: {0:#}")]
    Environment(anyhow::Error),
    /// Creating a handle or registering memory failed.
    #[error("failed to acquire vm resources: {0:#}")]
    Resource(anyhow::Error),
    /// The guest stopped in a way it isn't supposed to.
    #[error("guest execution failed: {0:#}")]
    Execution(anyhow::Error),
    /// The guest wrote something into the result channel that isn't a
    /// verdict.
    #[error("{0:#}")]
    Protocol(anyhow::Error),
}

impl Error {
    /// How the failure is reported.
    pub fn result_type(&self) -> ResultType {
        match self {
            Error::Environment(_) => ResultType::Conf,
            Error::Resource(_) | Error::Execution(_) | Error::Protocol(_) => ResultType::Broken,
        }
    }
}

/// Tag an [`anyhow::Result`] with an error class.
pub(crate) trait Classify<T> {
    fn environment(self) -> Result<T, Error>;
    fn resource(self) -> Result<T, Error>;
    fn execution(self) -> Result<T, Error>;
}

impl<T> Classify<T> for anyhow::Result<T> {
    fn environment(self) -> Result<T, Error> {
        self.map_err(Error::Environment)
    }

    fn resource(self) -> Result<T, Error> {
        self.map_err(Error::Resource)
    }

    fn execution(self) -> Result<T, Error> {
        self.map_err(Error::Execution)
    }
}
