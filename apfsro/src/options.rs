use crate::error::{ApfsError, Result};

/// Parsed mount options.
///
/// `uid`/`gid` are ownership overrides the host applies to every inode it
/// materializes; `None` leaves on-disk ownership alone. `vol` selects the
/// container volume slot to mount.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    pub vol: u32,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl MountOptions {
    /// Parse a comma-separated option list: `uid=<n>`, `gid=<n>`, `vol=<n>`.
    ///
    /// Empty segments between commas are skipped. Unknown keys and malformed
    /// integers are rejected.
    pub fn parse(options: &str) -> Result<Self> {
        let mut opts = MountOptions::default();

        for part in options.split(',') {
            if part.is_empty() {
                continue;
            }
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| ApfsError::InvalidOption(part.to_string()))?;
            let n: u32 = value
                .parse()
                .map_err(|_| ApfsError::InvalidOption(part.to_string()))?;
            match key {
                "vol" => opts.vol = n,
                "uid" => opts.uid = Some(n),
                "gid" => opts.gid = Some(n),
                _ => return Err(ApfsError::InvalidOption(part.to_string())),
            }
        }

        Ok(opts)
    }
}
