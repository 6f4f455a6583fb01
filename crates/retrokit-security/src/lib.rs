mod checksum;
mod path_guard;

pub use checksum::{sha256_hex, verify_sha256};
pub use path_guard::{
    PathValidator, ValidatedPath, ValidationError, ValidationLayer, ValidationObserver,
    ValidatorMode, MAX_PATH_BYTES,
};
