//! SFTP file-transfer channel
//!
//! Remote listing, stat, mkdir and byte streams over the SFTP subsystem.

pub mod error;
pub mod path_utils;
mod remote_fs;

pub use error::SftpError;
pub use remote_fs::{RemoteDirEntry, RemoteFs, RemoteMetadata, RemoteReader, RemoteWriter, RusshSftp};
