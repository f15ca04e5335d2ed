#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("MongoDB driver error: {source}")]
    Mongo {
        #[from]
        source: mongodb::error::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Invalid cron expression: {source}")]
    Cron {
        #[from]
        source: cron::error::Error,
    },

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}
