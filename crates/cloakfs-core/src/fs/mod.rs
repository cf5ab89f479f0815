//! Filesystem-facing pieces: encrypted file handles, name transformation
//! and per-directory IVs.

pub mod diriv;
pub mod file;
pub mod name;

pub use diriv::{create_diriv, read_diriv, DirIv, DirIvCache, DirIvError, DIRIV_LEN, DIRIV_NAME};
pub use file::EncryptedFile;
pub use name::{
    is_long_name, is_valid_plain_name, NameError, NameTransform, BADNAME_SUFFIX, LONGNAME_PREFIX,
    LONGNAME_SUFFIX, NAME_MAX,
};
