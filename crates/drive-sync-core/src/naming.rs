//! Path conventions shared by the engine.
//!
//! Text documents are markdown notes; everything else is a binary
//! attachment. Attachments pushed by the engine get a `-synced` marker
//! inserted before their extension so an orphaned copy can be recognised as
//! remote-managed without consulting the remote listing.

/// Marker inserted into the file name of synced attachments.
pub const SYNCED_MARKER: &str = "-synced";

/// Whether a path names a text (markdown) document.
pub fn is_text_document(path: &str) -> bool {
    extension(path).is_some_and(|ext| ext.eq_ignore_ascii_case("md"))
}

/// Final path segment.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Parent folder of a path, `None` at the vault root.
pub fn parent_folder(path: &str) -> Option<&str> {
    path.rfind('/').map(|pos| &path[..pos]).filter(|p| !p.is_empty())
}

/// Extension of the file name (after its last dot), ignoring dot-files.
fn extension(path: &str) -> Option<&str> {
    let name = file_name(path);
    match name.rfind('.') {
        Some(0) | None => None,
        Some(pos) => Some(&name[pos + 1..]),
    }
}

/// Byte offset (within the file name) where the extension part begins.
///
/// The first dot of the name counts, so `archive.tar.gz` splits as
/// `archive` + `.tar.gz`. A leading dot is part of the stem.
fn extension_start(name: &str) -> Option<usize> {
    name.char_indices()
        .skip(1)
        .find(|(_, c)| *c == '.')
        .map(|(i, _)| i)
}

/// Insert the synced marker before the file's extension.
///
/// `img/photo.png` -> `img/photo-synced.png`; a name without extension gets
/// the marker appended.
pub fn insert_synced_marker(path: &str) -> String {
    let name = file_name(path);
    let dir_len = path.len() - name.len();
    match extension_start(name) {
        Some(pos) => format!(
            "{}{}{}{}",
            &path[..dir_len],
            &name[..pos],
            SYNCED_MARKER,
            &name[pos..]
        ),
        None => format!("{}{}", path, SYNCED_MARKER),
    }
}

/// Whether the file name carries the synced marker before its extension.
pub fn has_synced_marker(path: &str) -> bool {
    let name = file_name(path);
    let stem = match extension_start(name) {
        Some(pos) => &name[..pos],
        None => name,
    };
    stem.ends_with(SYNCED_MARKER)
}

/// Whether `path` lies inside folder `folder`.
pub fn is_within(path: &str, folder: &str) -> bool {
    path.strip_prefix(folder)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Re-root `path` from folder `from` to folder `to`.
pub fn rebase(path: &str, from: &str, to: &str) -> Option<String> {
    path.strip_prefix(from)
        .filter(|rest| rest.starts_with('/'))
        .map(|rest| format!("{}{}", to, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_document_detection() {
        assert!(is_text_document("notes/a.md"));
        assert!(is_text_document("A.MD"));
        assert!(!is_text_document("img/photo.png"));
        assert!(!is_text_document("notes.md/readme"));
        assert!(!is_text_document(".md"));
    }

    #[test]
    fn test_insert_synced_marker() {
        assert_eq!(insert_synced_marker("photo.png"), "photo-synced.png");
        assert_eq!(
            insert_synced_marker("assets.v2/img/photo.png"),
            "assets.v2/img/photo-synced.png"
        );
        assert_eq!(
            insert_synced_marker("backup.tar.gz"),
            "backup-synced.tar.gz"
        );
        assert_eq!(insert_synced_marker("LICENSE"), "LICENSE-synced");
    }

    #[test]
    fn test_has_synced_marker() {
        assert!(has_synced_marker("img/photo-synced.png"));
        assert!(has_synced_marker("backup-synced.tar.gz"));
        assert!(has_synced_marker("LICENSE-synced"));
        assert!(!has_synced_marker("img/photo.png"));
        assert!(!has_synced_marker("photo-synced-copy.png"));
        assert!(has_synced_marker(&insert_synced_marker("a/b.pdf")));
    }

    #[test]
    fn test_parent_folder() {
        assert_eq!(parent_folder("a/b/c.md"), Some("a/b"));
        assert_eq!(parent_folder("c.md"), None);
    }

    #[test]
    fn test_rebase_and_within() {
        assert!(is_within("notes/a.md", "notes"));
        assert!(!is_within("notes2/a.md", "notes"));
        assert_eq!(
            rebase("notes/sub/a.md", "notes", "archive"),
            Some("archive/sub/a.md".to_string())
        );
        assert_eq!(rebase("notes2/a.md", "notes", "archive"), None);
    }
}
