use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Parse error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("No user id configured (set [session] user_id or pass --user)")]
    MissingUserId,

    #[error("Geofence not found: {0}")]
    ZoneNotFound(String),

    #[error("Channel error: {0}")]
    Channel(#[from] tungstenite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(status, response) => Error::Http {
                status,
                body: response.into_string().unwrap_or_default(),
            },
            ureq::Error::Transport(transport) => Error::Network(transport.to_string()),
        }
    }
}
