//! Credentials and generic POSIX permission checks.
//!
//! Checks run against cached mode/uid/gid only; they never issue a server
//! round trip.

use crate::error::{FsError, Result};
use crate::vfs::{AccessKinds, SetStat, StatMask};

const MODE_TYPE_MASK: u32 = 0o170000;
const MODE_REGULAR: u32 = 0o100000;

/// The identity an operation runs as.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl Credentials {
    pub fn root() -> Self {
        Self {
            uid: 0,
            gid: 0,
            groups: Vec::new(),
        }
    }

    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            groups: Vec::new(),
        }
    }

    pub fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }
}

/// Generic POSIX permission check against cached metadata.
pub fn check_permissions(
    creds: &Credentials,
    ats: AccessKinds,
    mode: u32,
    uid: u32,
    gid: u32,
) -> Result<()> {
    if creds.uid == 0 {
        // Root bypasses read/write checks; execute still requires at least
        // one x bit on non-directories.
        if ats.contains(AccessKinds::EXEC)
            && (mode & MODE_TYPE_MASK) != 0o040000
            && mode & 0o111 == 0
        {
            return Err(FsError::Access);
        }
        return Ok(());
    }

    let perms = if creds.uid == uid {
        (mode >> 6) & 0o7
    } else if creds.in_group(gid) {
        (mode >> 3) & 0o7
    } else {
        mode & 0o7
    };
    if ats.bits() & !perms != 0 {
        return Err(FsError::Access);
    }
    Ok(())
}

/// Validate a SetStat request against cached metadata, per the POSIX
/// ownership rules. The mask has already been restricted to
/// [`StatMask::SETTABLE`] by the caller.
pub fn check_set_stat(
    creds: &Credentials,
    stat: &SetStat,
    mode: u32,
    uid: u32,
    gid: u32,
) -> Result<()> {
    let is_owner = creds.uid == 0 || creds.uid == uid;

    if stat.mask.contains(StatMask::MODE) && !is_owner {
        return Err(FsError::Perm);
    }
    if stat.mask.contains(StatMask::UID) && creds.uid != 0 && stat.uid != uid {
        return Err(FsError::Perm);
    }
    if stat.mask.contains(StatMask::GID)
        && creds.uid != 0
        && !(creds.uid == uid && creds.in_group(stat.gid))
    {
        return Err(FsError::Perm);
    }
    if stat.mask.contains(StatMask::SIZE) {
        if (mode & MODE_TYPE_MASK) != MODE_REGULAR {
            return Err(FsError::Invalid);
        }
        check_permissions(creds, AccessKinds::WRITE, mode, uid, gid)?;
    }
    if stat.mask.intersects(StatMask::ATIME | StatMask::MTIME) && !is_owner {
        // A non-owner may only stamp "now", and only with write access.
        let explicit = (stat.mask.contains(StatMask::ATIME) && !stat.atime.is_now())
            || (stat.mask.contains(StatMask::MTIME) && !stat.mtime.is_now());
        if explicit {
            return Err(FsError::Perm);
        }
        check_permissions(creds, AccessKinds::WRITE, mode, uid, gid)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::SetTime;

    #[test]
    fn owner_rwx_bits_gate_owner_access() {
        let creds = Credentials::new(1000, 1000);
        assert!(check_permissions(&creds, AccessKinds::READ, 0o100400, 1000, 1000).is_ok());
        assert!(check_permissions(&creds, AccessKinds::WRITE, 0o100400, 1000, 1000).is_err());
    }

    #[test]
    fn group_membership_uses_group_bits() {
        let mut creds = Credentials::new(1000, 2000);
        creds.groups.push(3000);
        assert!(check_permissions(&creds, AccessKinds::READ, 0o100040, 500, 3000).is_ok());
        assert!(check_permissions(&creds, AccessKinds::READ, 0o100004, 500, 3000).is_err());
    }

    #[test]
    fn root_reads_regardless_of_bits_but_exec_needs_an_x_bit() {
        let root = Credentials::root();
        assert!(check_permissions(&root, AccessKinds::READ, 0o100000, 1, 1).is_ok());
        assert!(check_permissions(&root, AccessKinds::EXEC, 0o100644, 1, 1).is_err());
        assert!(check_permissions(&root, AccessKinds::EXEC, 0o100755, 1, 1).is_ok());
    }

    #[test]
    fn chmod_requires_ownership() {
        let creds = Credentials::new(1000, 1000);
        let req = SetStat {
            mask: StatMask::MODE,
            mode: 0o600,
            ..Default::default()
        };
        assert!(check_set_stat(&creds, &req, 0o100644, 1000, 1000).is_ok());
        assert!(matches!(
            check_set_stat(&creds, &req, 0o100644, 0, 0),
            Err(FsError::Perm)
        ));
    }

    #[test]
    fn chown_to_other_uid_requires_root() {
        let creds = Credentials::new(1000, 1000);
        let req = SetStat {
            mask: StatMask::UID,
            uid: 2000,
            ..Default::default()
        };
        assert!(matches!(
            check_set_stat(&creds, &req, 0o100644, 1000, 1000),
            Err(FsError::Perm)
        ));
        assert!(check_set_stat(&Credentials::root(), &req, 0o100644, 1000, 1000).is_ok());
    }

    #[test]
    fn truncate_needs_write_permission_and_a_regular_file() {
        let creds = Credentials::new(1000, 1000);
        let req = SetStat {
            mask: StatMask::SIZE,
            size: 0,
            ..Default::default()
        };
        assert!(check_set_stat(&creds, &req, 0o100644, 1000, 1000).is_ok());
        assert!(check_set_stat(&creds, &req, 0o100444, 1000, 1000).is_err());
        assert!(matches!(
            check_set_stat(&creds, &req, 0o040755, 1000, 1000),
            Err(FsError::Invalid)
        ));
    }

    #[test]
    fn non_owner_may_only_stamp_now_with_write_access() {
        let creds = Credentials::new(1000, 1000);
        let now_req = SetStat {
            mask: StatMask::MTIME,
            mtime: SetTime::Now,
            ..Default::default()
        };
        let explicit_req = SetStat {
            mask: StatMask::MTIME,
            mtime: SetTime::At(42),
            ..Default::default()
        };
        assert!(check_set_stat(&creds, &now_req, 0o100666, 500, 500).is_ok());
        assert!(check_set_stat(&creds, &now_req, 0o100644, 500, 500).is_err());
        assert!(matches!(
            check_set_stat(&creds, &explicit_req, 0o100666, 500, 500),
            Err(FsError::Perm)
        ));
    }
}
