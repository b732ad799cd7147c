//! Data models for setlist-import

pub mod catalog;

pub use catalog::{
    Artist, NewArtist, SetlistEntry, SetlistKind, Show, ShowOrigin, Song, Venue,
};
