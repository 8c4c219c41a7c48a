//! Feed ingestion: playlist and XMLTV parsing.

pub mod m3u;
pub mod xmltv_stream;

pub use m3u::{ParsedPlaylist, parse_m3u};
pub use xmltv_stream::{ParsedGuide, XmltvParseOptions, normalize_id};
