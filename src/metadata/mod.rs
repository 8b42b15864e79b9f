use std::collections::HashMap;
use std::path::Path;

use lofty::{Accessor, ItemKey, MimeType, Picture, PictureType, Probe, Tag, TagExt, TaggedFileExt};
use serde::{Deserialize, Serialize};

use crate::api::TrackSummary;
use crate::errors::{AppError, Result};
use crate::utils::sanitize_filename;

/// Keys of the flat tag map served by the catalog's metadata endpoint.
pub mod keys {
    pub const TITLE: &str = "title";
    pub const ARTIST: &str = "artist";
    pub const ALBUM: &str = "album";
    pub const ALBUM_ARTIST: &str = "album_artist";
    pub const TRACK_NUMBER: &str = "track_number";
    pub const RELEASE_YEAR: &str = "release_year";
    pub const LYRICS: &str = "lyrics";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileNamingFormat {
    ArtistTitle,
    TitleArtist,
    TitleOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagOptions {
    pub embed_cover_art: bool,
    pub embed_lyrics: bool,
    pub file_naming_format: FileNamingFormat,
    pub include_track_number: bool,
}

impl Default for TagOptions {
    fn default() -> Self {
        Self {
            embed_cover_art: true,
            embed_lyrics: true,
            file_naming_format: FileNamingFormat::ArtistTitle,
            include_track_number: false,
        }
    }
}

/// Final filename for a finished download, derived from the naming settings
/// and the resolved tag map, with the track summary as fallback.
pub fn file_name_for(
    track: &TrackSummary,
    tags: &HashMap<String, String>,
    options: &TagOptions,
    extension: &str,
) -> String {
    let title = tags
        .get(keys::TITLE)
        .cloned()
        .unwrap_or_else(|| track.title.clone());
    let artist = tags
        .get(keys::ARTIST)
        .cloned()
        .unwrap_or_else(|| track.artist_line());

    let mut stem = match options.file_naming_format {
        FileNamingFormat::ArtistTitle => format!("{} - {}", artist, title),
        FileNamingFormat::TitleArtist => format!("{} - {}", title, artist),
        FileNamingFormat::TitleOnly => title,
    };

    if options.include_track_number {
        if let Some(number) = tags
            .get(keys::TRACK_NUMBER)
            .and_then(|n| n.parse::<u32>().ok())
        {
            stem = format!("{:02} - {}", number, stem);
        }
    }

    format!("{}.{}", sanitize_filename(&stem), extension)
}

/// Writes the resolved tag map into the finished audio file.
pub struct Tagger;

impl Tagger {
    pub fn apply(
        path: &Path,
        tags: &HashMap<String, String>,
        cover: Option<&[u8]>,
        options: &TagOptions,
    ) -> Result<()> {
        let mut tagged_file = Probe::open(path)?.read()?;

        if tagged_file.primary_tag_mut().is_none() {
            let tag_type = tagged_file.primary_tag_type();
            tagged_file.insert_tag(Tag::new(tag_type));
        }
        let Some(tag) = tagged_file.primary_tag_mut() else {
            return Err(AppError::InvalidInput(format!(
                "no writable tag for {}",
                path.display()
            )));
        };

        if let Some(title) = tags.get(keys::TITLE) {
            tag.set_title(title.clone());
        }
        if let Some(artist) = tags.get(keys::ARTIST) {
            tag.set_artist(artist.clone());
        }
        if let Some(album) = tags.get(keys::ALBUM) {
            tag.set_album(album.clone());
        }
        if let Some(album_artist) = tags.get(keys::ALBUM_ARTIST) {
            tag.insert_text(ItemKey::AlbumArtist, album_artist.clone());
        }
        if let Some(number) = tags
            .get(keys::TRACK_NUMBER)
            .and_then(|n| n.parse::<u32>().ok())
        {
            tag.set_track(number);
        }
        if let Some(year) = tags
            .get(keys::RELEASE_YEAR)
            .and_then(|y| y.parse::<u32>().ok())
        {
            tag.set_year(year);
        }

        if options.embed_lyrics {
            if let Some(lyrics) = tags.get(keys::LYRICS) {
                tag.insert_text(ItemKey::Lyrics, lyrics.clone());
            }
        }

        if options.embed_cover_art {
            if let Some(data) = cover {
                let mime = if data.starts_with(&[0x89, b'P', b'N', b'G']) {
                    MimeType::Png
                } else {
                    MimeType::Jpeg
                };
                let picture =
                    Picture::new_unchecked(PictureType::CoverFront, Some(mime), None, data.to_vec());
                tag.push_picture(picture);
            }
        }

        tag.save_to_path(path)?;
        Ok(())
    }
}
