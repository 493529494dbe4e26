//! Song value type

/// A single song entry.
///
/// Immutable once constructed and compared by value: two songs are equal
/// when title, artist and path match. The index is a playlist position
/// hint and deliberately excluded from equality.
#[derive(Debug, Clone, Eq)]
pub struct Song {
    pub index: i32,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub full_path: String,
}

impl Song {
    pub fn new(index: i32, title: Option<&str>, artist: Option<&str>, full_path: &str) -> Self {
        Self {
            index,
            title: title.map(str::to_owned),
            artist: artist.map(str::to_owned),
            full_path: full_path.to_owned(),
        }
    }

    /// Title falling back to the file path for untagged files.
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.full_path)
    }
}

impl PartialEq for Song {
    fn eq(&self, other: &Self) -> bool {
        self.title == other.title
            && self.artist == other.artist
            && self.full_path == other.full_path
    }
}
