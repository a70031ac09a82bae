use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("yaml parse error at {path}: {source}")]
    YamlParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config at {path}: {message}")]
    Conversion { path: String, message: String },

    #[error("duplicate device name '{0}'")]
    DuplicateDevice(String),

    #[error("connection references unknown device '{0}'")]
    UnknownDevice(String),
}
