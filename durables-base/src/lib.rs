mod error;

pub use error::{
    codec_failure, err, invalid_argument, invalid_operation, storage_failure,
    unsupported_command, unsupported_version, Error, ErrorKind, Result,
};
