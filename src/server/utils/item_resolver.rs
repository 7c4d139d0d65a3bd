use once_cell::sync::Lazy;
use regex::Regex;

use crate::server::error::{AppResult, Error};
use crate::server::utils::http_utils::raw_query_param;

/// pulls the resource id out of the request path, both item and video shaped
/// routes, with or without the /emby prefix some clients insist on
static ITEM_PATH_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)/(?:emby/)?(?:items|videos)/([^/?]+)").expect("static regex"));

/// which media sources a request is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSelector {
    /// no MediaSourceId param - the whole document
    All,
    /// a single source, holding the VERBATIM still-escaped id from the query
    Specific(String),
}

impl SourceSelector {
    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    pub fn raw_id(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::Specific(raw) => Some(raw),
        }
    }
}

/// canonical per-request resource identity, built once per inbound request
/// and thrown away afterwards
#[derive(Debug, Clone)]
pub struct ItemSelector {
    pub item_id: String,
    pub source: SourceSelector,
    /// upstream path to re-request a full playback document for this item
    pub playback_info_path: String,
}

impl ItemSelector {
    pub fn resolve(path: &str, raw_query: Option<&str>) -> AppResult<Self> {
        let item_id = ITEM_PATH_REGEX
            .captures(path)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| {
                Error::MalformedRequest(format!("no resource id in path: {}", path))
            })?;

        let source = raw_query
            .and_then(|q| raw_query_param(q, "MediaSourceId"))
            .filter(|raw| !raw.is_empty())
            .map(SourceSelector::Specific)
            .unwrap_or(SourceSelector::All);

        let playback_info_path = format!("/Items/{}/PlaybackInfo", item_id);

        Ok(Self {
            item_id,
            source,
            playback_info_path,
        })
    }
}

/// compare two (possibly escaped) source ids. escaping isn't guaranteed
/// stable between what a client sends and what sits in a cached document,
/// so both sides get unescaped before the comparison
pub fn ids_match(a: &str, b: &str) -> bool {
    let da = urlencoding::decode(a).map(|s| s.into_owned());
    let db = urlencoding::decode(b).map(|s| s.into_owned());
    match (da, db) {
        (Ok(da), Ok(db)) => da == db,
        // undecodable ids fall back to a literal comparison
        _ => a == b,
    }
}
