//! Translation between Windows paths and the paths a WSL distro sees.

use crate::error::{BridgeError, Result};

const UNC_PREFIX: &str = r"\\wsl$\";

/// `C:\Users\me\x.py` -> `/mnt/c/Users/me/x.py`.
///
/// Paths that already start with `/` are returned unchanged.
pub fn native_to_compat_path(path: &str) -> Result<String> {
    if path.starts_with('/') {
        return Ok(path.to_string());
    }
    if path.len() < 3 {
        return Err(BridgeError::invalid_argument(format!(
            "invalid Windows path: '{path}'"
        )));
    }

    let mut chars = path.chars();
    let drive = chars.next().filter(char::is_ascii_alphabetic);
    let colon = chars.next();
    let (Some(drive), Some(':')) = (drive, colon) else {
        return Err(BridgeError::invalid_argument(format!(
            "path '{path}' does not start with a drive letter"
        )));
    };

    let rest = chars.as_str().replace('\\', "/");
    if !rest.starts_with('/') {
        return Err(BridgeError::invalid_argument(format!(
            "path '{path}' is not absolute"
        )));
    }
    Ok(format!("/mnt/{}{rest}", drive.to_ascii_lowercase()))
}

/// `/home/me/x.py` in `Ubuntu` -> `\\wsl$\Ubuntu\home\me\x.py`.
///
/// Only paths under `/home/` are accepted. Inputs that are already UNC are
/// returned unchanged.
pub fn compat_to_native_unc(distro: &str, path: &str) -> Result<String> {
    if distro.trim().is_empty() {
        return Err(BridgeError::invalid_argument("distro name cannot be empty"));
    }
    if path.trim().is_empty() {
        return Err(BridgeError::invalid_argument("path cannot be empty"));
    }
    if path.starts_with(UNC_PREFIX) {
        return Ok(path.to_string());
    }
    if !path.starts_with("/home/") {
        return Err(BridgeError::invalid_argument(format!(
            "only paths under /home/ can be mapped to a UNC path, got '{path}'"
        )));
    }
    Ok(format!("{UNC_PREFIX}{distro}{}", path.replace('/', "\\")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_native_to_compat() {
        assert_eq!(
            native_to_compat_path(r"C:\Users\John\file.txt").unwrap(),
            "/mnt/c/Users/John/file.txt"
        );
        assert_eq!(
            native_to_compat_path(r"D:\data\My Docs\env.yaml").unwrap(),
            "/mnt/d/data/My Docs/env.yaml"
        );
        assert_eq!(native_to_compat_path("E:/x/y").unwrap(), "/mnt/e/x/y");
    }

    #[test]
    fn test_native_to_compat_passes_linux_paths_through() {
        assert_eq!(
            native_to_compat_path("/home/u/x.py").unwrap(),
            "/home/u/x.py"
        );
    }

    #[test]
    fn test_native_to_compat_rejects_bad_input() {
        for bad in ["", "C:", "ab", r"relative\path", "1:\\x", "C:file.txt"] {
            let error = native_to_compat_path(bad).unwrap_err();
            assert_eq!(error.kind(), ErrorKind::InvalidArgument, "{bad}");
        }
    }

    #[test]
    fn test_compat_to_native_unc() {
        assert_eq!(
            compat_to_native_unc("Ubuntu", "/home/u/envs/x").unwrap(),
            r"\\wsl$\Ubuntu\home\u\envs\x"
        );
        assert_eq!(
            compat_to_native_unc("Ubuntu", r"\\wsl$\Ubuntu\home\u").unwrap(),
            r"\\wsl$\Ubuntu\home\u"
        );
    }

    #[test]
    fn test_compat_to_native_unc_rejects_bad_input() {
        assert!(compat_to_native_unc("", "/home/u").is_err());
        assert!(compat_to_native_unc("Ubuntu", "").is_err());
        let error = compat_to_native_unc("Ubuntu", "/opt/conda").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidArgument);
    }
}
