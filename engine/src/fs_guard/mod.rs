use sdk::errors::EngineError;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncReadExt;

/// FileSystemGuard confines every file action to the configured workspace.
///
/// Relative paths coming from the user or from model tool-calls are resolved
/// against the workspace root, canonicalized, and rejected if the result is
/// not contained in the canonical root. This blocks `../` traversal, absolute
/// path overrides and symlinks that point outside the workspace.
///
/// # Security Model
///
/// The guard implements a four-gate validation process:
/// 1. Check deny list on the requested path
/// 2. Canonicalize (leniently for paths that do not exist yet)
/// 3. Check deny list on the canonical path, relative to the root
/// 4. Verify the canonical path is within the workspace
///
/// Resolution is pure path computation; callers perform the I/O.
#[derive(Debug, Clone)]
pub struct FileSystemGuard {
    workspace: PathBuf,
    deny_list: Vec<PathBuf>,
}

/// Content read through the guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContents {
    /// Canonical path that was read
    pub path: PathBuf,

    /// File content, lossily decoded as UTF-8
    pub content: String,

    /// True when the file was longer than the byte budget
    pub truncated: bool,
}

impl FileSystemGuard {
    /// Creates a new FileSystemGuard rooted at `workspace`.
    ///
    /// The deny list includes common credential locations (.ssh, .env,
    /// private keys, cloud credentials) that stay off-limits even inside the
    /// workspace.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::PathCanonicalization` if the workspace does not
    /// exist or cannot be resolved.
    pub fn new(workspace: PathBuf) -> Result<Self, EngineError> {
        // Canonicalize workspace to handle symlinks (e.g., /var -> /private/var on macOS)
        let workspace = workspace
            .canonicalize()
            .map_err(|e| EngineError::PathCanonicalization(workspace.clone(), e.to_string()))?;

        let deny_list = vec![
            PathBuf::from(".ssh"),
            PathBuf::from(".env"),
            PathBuf::from(".aws/credentials"),
            PathBuf::from(".config/gcloud"),
            PathBuf::from("id_rsa"),
            PathBuf::from("id_ed25519"),
            PathBuf::from("id_dsa"),
            PathBuf::from(".gnupg"),
            PathBuf::from(".kube/config"),
        ];

        Ok(Self {
            workspace,
            deny_list,
        })
    }

    /// Resolves `relative` against the workspace root.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::PathDenied` if the path matches the deny list.
    /// Returns `EngineError::PathOutsideWorkspace` if the path escapes the root.
    /// Returns `EngineError::PathCanonicalization` if resolution fails.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::path::PathBuf;
    /// use aira_engine::fs_guard::FileSystemGuard;
    ///
    /// let guard = FileSystemGuard::new(PathBuf::from("/home/pi/project")).unwrap();
    ///
    /// assert!(guard.resolve("src/main.rs").is_ok());
    /// assert!(guard.resolve("../../etc/passwd").is_err());
    /// ```
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, EngineError> {
        let requested = Path::new(relative.trim());

        // Gate 1: Check deny list before canonicalization
        if self.is_denied(requested) {
            return Err(EngineError::PathDenied(requested.to_path_buf()));
        }

        // Absolute inputs replace the root here and are caught by gate 4
        let candidate = self.workspace.join(requested);

        // Gate 2: Canonicalize to resolve symlinks and .. patterns
        let canonical = canonicalize_lenient(&candidate)?;

        // Gate 4: Verify within workspace
        let inside = canonical
            .strip_prefix(&self.workspace)
            .map_err(|_| EngineError::PathOutsideWorkspace(canonical.clone()))?;

        // Gate 3: Check deny list after canonicalization (catches symlink bypasses)
        if self.is_denied(inside) {
            return Err(EngineError::PathDenied(canonical));
        }

        Ok(canonical)
    }

    /// Reads at most `max_bytes` of a regular file inside the workspace.
    ///
    /// Longer files are truncated rather than rejected.
    ///
    /// # Errors
    ///
    /// Security errors from [`resolve`](Self::resolve), or
    /// `EngineError::NotAFile` if the path is missing or not a regular file.
    pub async fn read_file(
        &self,
        relative: &str,
        max_bytes: usize,
    ) -> Result<FileContents, EngineError> {
        let path = self.resolve(relative)?;

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|_| EngineError::NotAFile(path.clone()))?;
        if !metadata.is_file() {
            return Err(EngineError::NotAFile(path));
        }

        let file = tokio::fs::File::open(&path).await?;
        let mut buffer = Vec::with_capacity(max_bytes.min(metadata.len() as usize));
        // Read one extra byte to learn whether the file was cut short
        file.take(max_bytes as u64 + 1)
            .read_to_end(&mut buffer)
            .await?;

        let truncated = buffer.len() > max_bytes;
        buffer.truncate(max_bytes);

        Ok(FileContents {
            path,
            content: String::from_utf8_lossy(&buffer).into_owned(),
            truncated,
        })
    }

    /// Checks if a path matches any entry in the deny list.
    ///
    /// Matches either a denied suffix (`.aws/credentials`) or any single
    /// component equal to a denied name (`project/.env/config`).
    fn is_denied(&self, path: &Path) -> bool {
        self.deny_list.iter().any(|denied| {
            path.ends_with(denied)
                || path.components().any(|c| {
                    c.as_os_str()
                        .to_str()
                        .zip(denied.to_str())
                        .is_some_and(|(component, d)| component == d)
                })
        })
    }

    /// Returns a reference to the workspace path.
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Path relative to the workspace, for display to the user.
    pub fn display_relative(&self, path: &Path) -> String {
        match path.strip_prefix(&self.workspace) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.display().to_string(),
            Err(_) => path.display().to_string(),
        }
    }
}

/// Canonicalizes `path`, tolerating a missing tail.
///
/// `.` and `..` are applied lexically first, then the deepest existing
/// ancestor is canonicalized on disk (resolving symlinks) and the missing
/// components are appended, so `root/new/file.txt` resolves before it exists.
fn canonicalize_lenient(path: &Path) -> Result<PathBuf, EngineError> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }

    let mut existing = normalize_lexically(path);
    let mut tail = Vec::new();
    while !existing.exists() {
        let Some(name) = existing.file_name().map(|n| n.to_os_string()) else {
            break;
        };
        tail.push(name);
        existing.pop();
    }

    let mut resolved = existing
        .canonicalize()
        .map_err(|e| EngineError::PathCanonicalization(path.to_path_buf(), e.to_string()))?;
    for name in tail.iter().rev() {
        resolved.push(name);
    }

    Ok(resolved)
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
