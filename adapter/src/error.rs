use std::net::SocketAddr;

use thiserror::Error;

use crate::leader::leader::LeaderElectionError;

// Errors that end the internal run and, with it, the process.
#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes client error: {0}")]
    Kube(#[from] kube::Error),

    #[error("failed to set up metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("failed to listen on {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: warp::Error,
    },

    #[error(transparent)]
    LeaderElection(#[from] LeaderElectionError),

    #[error("{0}")]
    Fatal(String),
}
