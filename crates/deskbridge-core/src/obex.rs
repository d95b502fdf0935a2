//! Incoming OBEX push: where received files go and what the user is told.

use std::path::{Path, PathBuf};

use crate::config::ObexConfig;
use crate::error::Result;

pub const ERROR_REJECTED: &str = "org.bluez.obex.Error.Rejected";
pub const MSG_NOT_AUTHORIZED: &str = "Not Authorized";

const COMPRESSION_SUFFIXES: &[&str] = &[".gz", ".bz2", ".Z", ".lz", ".xz"];
const DOUBLE_EXTENSIONS: &[&str] = &["tar", "ps", "xcf", "dvi", "txt", "text"];

/// Split a file name into stem and extension, keeping `.tar.gz` style
/// double extensions together. The extension includes its leading dot and
/// is empty when there is none.
pub fn split_extension(name: &str) -> (&str, &str) {
    if let Some(compression) = COMPRESSION_SUFFIXES.iter().find(|s| name.ends_with(*s)) {
        for ext in DOUBLE_EXTENSIONS {
            let suffix = format!(".{}{}", ext, compression);
            if name.ends_with(&suffix) && name.len() > suffix.len() {
                return name.split_at(name.len() - suffix.len());
            }
        }
    }

    let base_start = name.rfind('/').map_or(0, |i| i + 1);
    match name[base_start..].rfind('.') {
        // a leading dot marks a hidden file, not an extension
        Some(0) | None => (name, ""),
        Some(dot) => name.split_at(base_start + dot),
    }
}

/// First path in `dir` that does not exist yet: `name`, then `stem(1).ext`,
/// `stem(2).ext` and so on.
pub fn unique_download_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = split_extension(name);
    let mut serial: u32 = 1;
    loop {
        let candidate = dir.join(format!("{}({}){}", stem, serial, ext));
        if !candidate.exists() {
            return candidate;
        }
        serial += 1;
    }
}

/// Reduce a remote-supplied name to a bare file name.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit('/').next().unwrap_or("").trim();
    if base.is_empty() || base == "." || base == ".." {
        "received-file".to_string()
    } else {
        base.to_string()
    }
}

/// Choose the download directory: the configured one, else the XDG download
/// directory unless it is the home directory itself, else `~/Downloads`.
pub fn select_download_dir(
    configured: Option<&Path>,
    xdg_download: Option<PathBuf>,
    home: Option<PathBuf>,
) -> Option<PathBuf> {
    if let Some(dir) = configured {
        return Some(dir.to_path_buf());
    }
    if let Some(dir) = xdg_download
        && home.as_ref() != Some(&dir)
    {
        return Some(dir);
    }
    home.map(|h| h.join("Downloads"))
}

/// Resolve and create the download directory.
pub fn download_dir(config: &ObexConfig) -> Result<PathBuf> {
    let dir = select_download_dir(
        config.download_dir.as_deref(),
        dirs::download_dir(),
        dirs::home_dir(),
    )
    .ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no download directory and no home directory",
        )
    })?;
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Directory that holds files while they are being received.
pub fn incoming_dir() -> Result<PathBuf> {
    let dir = dirs::cache_dir()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no cache directory"))?
        .join("obexd");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// State reported by `org.bluez.obex.Transfer1.Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Queued,
    Active,
    Suspended,
    Complete,
    Error,
}

impl TransferStatus {
    pub fn parse(status: &str) -> Option<Self> {
        match status {
            "queued" => Some(Self::Queued),
            "active" => Some(Self::Active),
            "suspended" => Some(Self::Suspended),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// Whether to accept a push without asking.
pub fn auto_accept(config: &ObexConfig, sender_paired: bool) -> bool {
    config.accept_paired && sender_paired
}

/// Summary and body of a desktop notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub summary: String,
    pub body: String,
}

/// Notification asking whether to accept `file_name` from `device`.
pub fn transfer_request_notice(device: &str, file_name: &str) -> Notice {
    Notice {
        summary: format!("Bluetooth file transfer from {}", device),
        body: file_name.to_string(),
    }
}

/// Notification for a completed transfer stored at `path`.
pub fn received_notice(path: &Path) -> Notice {
    let display = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Notice {
        summary: "You received a file".to_string(),
        body: format!("You received “{}” via Bluetooth", display),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_extension_simple() {
        assert_eq!(split_extension("photo.jpg"), ("photo", ".jpg"));
        assert_eq!(split_extension("archive.tar.gz"), ("archive", ".tar.gz"));
        assert_eq!(split_extension("notes.txt.xz"), ("notes", ".txt.xz"));
        assert_eq!(split_extension("data.json.gz"), ("data.json", ".gz"));
        assert_eq!(split_extension("README"), ("README", ""));
        assert_eq!(split_extension(".bashrc"), (".bashrc", ""));
        assert_eq!(split_extension("dir.d/file"), ("dir.d/file", ""));
        assert_eq!(split_extension("a.b.c"), ("a.b", ".c"));
    }

    #[test]
    fn test_unique_download_path() {
        let dir = std::env::temp_dir().join("deskbridge_test_unique_download_path");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        assert_eq!(unique_download_path(&dir, "song.tar.gz"), dir.join("song.tar.gz"));

        std::fs::write(dir.join("song.tar.gz"), b"x").unwrap();
        assert_eq!(unique_download_path(&dir, "song.tar.gz"), dir.join("song(1).tar.gz"));

        std::fs::write(dir.join("song(1).tar.gz"), b"x").unwrap();
        assert_eq!(unique_download_path(&dir, "song.tar.gz"), dir.join("song(2).tar.gz"));

        std::fs::write(dir.join("README"), b"x").unwrap();
        assert_eq!(unique_download_path(&dir, "README"), dir.join("README(1)"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("photo.jpg"), "photo.jpg");
        assert_eq!(sanitize_file_name(".."), "received-file");
        assert_eq!(sanitize_file_name("dir/"), "received-file");
    }

    #[test]
    fn test_select_download_dir() {
        let home = PathBuf::from("/home/me");
        let xdg = PathBuf::from("/home/me/Téléchargements");

        assert_eq!(
            select_download_dir(Some(Path::new("/srv/in")), Some(xdg.clone()), Some(home.clone())),
            Some(PathBuf::from("/srv/in"))
        );
        assert_eq!(
            select_download_dir(None, Some(xdg.clone()), Some(home.clone())),
            Some(xdg)
        );
        // XDG dir pointing at $HOME is ignored
        assert_eq!(
            select_download_dir(None, Some(home.clone()), Some(home.clone())),
            Some(PathBuf::from("/home/me/Downloads"))
        );
        assert_eq!(select_download_dir(None, None, None), None);
    }

    #[test]
    fn test_transfer_status() {
        assert_eq!(TransferStatus::parse("complete"), Some(TransferStatus::Complete));
        assert!(TransferStatus::Error.is_finished());
        assert!(!TransferStatus::Active.is_finished());
        assert_eq!(TransferStatus::parse("bogus"), None);
    }

    #[test]
    fn test_auto_accept() {
        let mut config = ObexConfig::default();
        assert!(auto_accept(&config, true));
        assert!(!auto_accept(&config, false));
        config.accept_paired = false;
        assert!(!auto_accept(&config, true));
    }

    #[test]
    fn test_notices() {
        let ask = transfer_request_notice("Phone", "photo.jpg");
        assert_eq!(ask.summary, "Bluetooth file transfer from Phone");
        assert_eq!(ask.body, "photo.jpg");

        let done = received_notice(Path::new("/home/me/Downloads/photo(1).jpg"));
        assert_eq!(done.summary, "You received a file");
        assert_eq!(done.body, "You received “photo(1).jpg” via Bluetooth");
    }
}
