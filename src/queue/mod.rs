pub mod coordinator;
pub mod download;
pub mod entry;
pub mod prefetch;
pub mod worker;

use thiserror::Error;

use entry::SongStatus;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("no song with id {0}")]
    UnknownSong(String),

    #[error("song {id} cannot go from {from:?} to {to:?}")]
    IllegalTransition {
        id: String,
        from: SongStatus,
        to: SongStatus,
    },

    #[error("download of {url} failed: {reason}")]
    Download { url: String, reason: String },

    #[error("download cancelled")]
    Cancelled,

    #[error("this process has no song queue")]
    NoQueue,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
