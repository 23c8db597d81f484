//! Account lookup for privilege drop

use migpart_core::{PartitionError, PartitionResult};
use std::ffi::{CStr, CString};
use std::path::PathBuf;

const INITIAL_BUFFER: usize = 1024;
const MAX_BUFFER: usize = 1 << 20;

/// Identity a workload runs as after privilege drop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

/// Resolve a user name through the system account database
pub fn lookup_user(name: &str) -> PartitionResult<UserIdentity> {
    let c_name =
        CString::new(name).map_err(|_| PartitionError::UnknownUser(name.to_string()))?;

    let mut buffer_len = INITIAL_BUFFER;
    loop {
        let mut buffer = vec![0 as libc::c_char; buffer_len];
        // SAFETY: zeroed passwd is a valid out-parameter for getpwnam_r.
        let mut passwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();

        // SAFETY: every pointer refers to live storage for the duration of
        // the call and `buffer_len` matches the allocation.
        let rc = unsafe {
            libc::getpwnam_r(
                c_name.as_ptr(),
                &mut passwd,
                buffer.as_mut_ptr(),
                buffer_len,
                &mut result,
            )
        };

        if rc == libc::ERANGE && buffer_len < MAX_BUFFER {
            buffer_len *= 2;
            continue;
        }
        if rc != 0 {
            return Err(std::io::Error::from_raw_os_error(rc).into());
        }
        if result.is_null() {
            return Err(PartitionError::UnknownUser(name.to_string()));
        }

        // SAFETY: on success pw_dir points into `buffer`, which is still alive.
        let home = unsafe { CStr::from_ptr(passwd.pw_dir) }
            .to_string_lossy()
            .into_owned();

        return Ok(UserIdentity {
            name: name.to_string(),
            uid: passwd.pw_uid,
            gid: passwd.pw_gid,
            home: PathBuf::from(home),
        });
    }
}
