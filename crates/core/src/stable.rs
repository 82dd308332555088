//! Stable locations: named commits with warmed-up builds.
//!
//! The location list, the autocomplete options and the remote bookmark
//! names are fetched through a [`SingleFlightCache`], so concurrent callers
//! share one request. Options and remote bookmarks are fetched once per
//! session; the location list is refetched after every add or remove.
//! Replies are only ever cached by the fetch that asked for them.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, instrument};

use crate::cache::SingleFlightCache;
use crate::channel::RequestChannel;
use crate::errors::FetchError;
use crate::models::{
    BookmarkEntry, CommitRef, Fetched, PlaceholderState, StableInfo, StableLocationData,
    TypeaheadOption,
};
use crate::protocol::{ClientMessage, MessageKind, ServerMessage};

#[derive(Debug)]
pub struct StableLocations {
    channel: RequestChannel,
    locations: SingleFlightCache<(), StableLocationData>,
    typeahead: SingleFlightCache<(), Vec<TypeaheadOption>>,
    remote: SingleFlightCache<(), Vec<String>>,
    latest: Mutex<Option<CommitRef>>,
}

impl StableLocations {
    pub fn new(channel: RequestChannel) -> Self {
        Self {
            channel,
            locations: SingleFlightCache::new("stable_locations"),
            typeahead: SingleFlightCache::new("stable_typeahead"),
            remote: SingleFlightCache::new("remote_bookmarks"),
            latest: Mutex::new(None),
        }
    }

    fn latest_slot(&self) -> MutexGuard<'_, Option<CommitRef>> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Special and manual stable locations known to the backend.
    pub async fn fetch(&self) -> Result<StableLocationData, FetchError> {
        let channel = self.channel.clone();
        self.locations
            .get((), move || {
                let reply = channel.await_next(MessageKind::FetchedStableLocations);
                channel.send(ClientMessage::FetchStableLocations);
                async move {
                    match reply.await? {
                        ServerMessage::FetchedStableLocations { stables } => Ok(stables),
                        other => Err(FetchError::Server(format!(
                            "unexpected reply: {:?}",
                            other.kind()
                        ))),
                    }
                }
            })
            .await
    }

    /// Drop the cached locations and fetch them again.
    pub async fn refresh(&self) -> Result<StableLocationData, FetchError> {
        self.locations.invalidate(&());
        self.fetch().await
    }

    /// Ask the backend to track a user-chosen location.
    #[instrument(skip(self))]
    pub fn add_manual(&self, name: &str) -> Result<String, FetchError> {
        let name = normalize_name(name)?;
        info!(%name, "adding manual stable location");
        self.channel.send(ClientMessage::AddManualStable { name: name.clone() });
        self.locations.invalidate(&());
        Ok(name)
    }

    #[instrument(skip(self))]
    pub fn remove_manual(&self, name: &str) -> Result<String, FetchError> {
        let name = normalize_name(name)?;
        info!(%name, "removing manual stable location");
        self.channel
            .send(ClientMessage::RemoveManualStable { name: name.clone() });
        self.locations.invalidate(&());
        Ok(name)
    }

    /// Start fetching autocomplete options without waiting for them.
    pub fn prefetch_autocomplete(&self) {
        drop(self.typeahead_options());
    }

    /// Options whose value or label contains `query`, ignoring case.
    pub async fn autocomplete(&self, query: &str) -> Result<Vec<TypeaheadOption>, FetchError> {
        let options = self.typeahead_options().await?;
        let needle = query.to_lowercase();
        Ok(options
            .into_iter()
            .filter(|opt| {
                opt.value.to_lowercase().contains(&needle)
                    || opt.label.to_lowercase().contains(&needle)
            })
            .collect())
    }

    fn typeahead_options(&self) -> crate::cache::SharedFetch<Vec<TypeaheadOption>> {
        let channel = self.channel.clone();
        self.typeahead.get((), move || {
            let reply = channel.await_next(MessageKind::FetchedStableLocationAutocompleteOptions);
            channel.send(ClientMessage::FetchStableLocationAutocompleteOptions);
            async move {
                match reply.await? {
                    ServerMessage::FetchedStableLocationAutocompleteOptions { result } => result
                        .into_result()
                        .map(Option::unwrap_or_default)
                        .map_err(FetchError::Server),
                    other => Err(FetchError::Server(format!(
                        "unexpected reply: {:?}",
                        other.kind()
                    ))),
                }
            }
        })
    }

    /// Remote bookmark names known to the backend.
    pub async fn remote_bookmarks(&self) -> Result<Vec<String>, FetchError> {
        let channel = self.channel.clone();
        self.remote
            .get((), move || {
                let reply = channel.await_next(MessageKind::FetchedRemoteBookmarks);
                channel.send(ClientMessage::FetchRemoteBookmarks);
                async move {
                    match reply.await? {
                        ServerMessage::FetchedRemoteBookmarks { bookmarks } => Ok(bookmarks),
                        other => Err(FetchError::Server(format!(
                            "unexpected reply: {:?}",
                            other.kind()
                        ))),
                    }
                }
            })
            .await
    }

    /// The newest public commit seen so far.
    pub fn latest_public(&self) -> Option<CommitRef> {
        self.latest_slot().clone()
    }

    /// Ask the backend for the newest public commit.
    pub async fn fetch_latest_public(&self) -> Result<CommitRef, FetchError> {
        let reply = self.channel.await_next(MessageKind::LatestPublicCommit);
        self.channel.send(ClientMessage::FetchLatestPublicCommit);
        match reply.await? {
            ServerMessage::LatestPublicCommit { hash, date } => {
                let commit = CommitRef { hash, date };
                *self.latest_slot() = Some(commit.clone());
                Ok(commit)
            }
            other => Err(FetchError::Server(format!(
                "unexpected reply: {:?}",
                other.kind()
            ))),
        }
    }

    /// Track the latest public commit. Called for every inbound message.
    pub fn observe(&self, message: &ServerMessage) {
        if let ServerMessage::LatestPublicCommit { hash, date } = message {
            debug!(%hash, "latest public commit updated");
            *self.latest_slot() = Some(CommitRef {
                hash: hash.clone(),
                date: *date,
            });
        }
    }

    /// Display rows for `data`, flagged against the latest known public commit.
    pub fn entries(&self, data: &StableLocationData) -> Vec<BookmarkEntry> {
        bookmark_entries(data, self.latest_public().as_ref())
    }
}

fn normalize_name(name: &str) -> Result<String, FetchError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(FetchError::InvalidRequest(
            "stable location name must not be empty".into(),
        ));
    }
    Ok(name.to_string())
}

/// Whether `info` points at a commit newer than the latest pulled public
/// commit. Unknown latest means no warning.
pub fn is_newer_than_latest(info: &StableInfo, latest: Option<&CommitRef>) -> bool {
    latest.is_some_and(|latest| info.date > latest.date)
}

/// Build the display list for stable locations.
///
/// Special locations without a value are skipped. Manual locations still
/// loading (including ones reported with neither value nor error) or failed
/// become placeholders.
pub fn bookmark_entries(
    data: &StableLocationData,
    latest: Option<&CommitRef>,
) -> Vec<BookmarkEntry> {
    let special = data
        .special
        .iter()
        .filter_map(|fetched| fetched.value.as_ref())
        .map(|info| detailed(info, latest, false));

    let manual = data.manual.iter().map(|(name, fetched)| match fetched {
        Some(Fetched {
            error: Some(error), ..
        }) => BookmarkEntry::Placeholder {
            name: name.clone(),
            state: PlaceholderState::Failed(error.lines().next().unwrap_or_default().to_string()),
        },
        Some(Fetched {
            value: Some(info), ..
        }) => detailed(info, latest, true),
        None | Some(Fetched { .. }) => BookmarkEntry::Placeholder {
            name: name.clone(),
            state: PlaceholderState::Loading,
        },
    });

    special.chain(manual).collect()
}

/// Display rows for remote bookmarks: bare names, first occurrence wins.
pub fn remote_bookmark_entries(names: &[String]) -> Vec<BookmarkEntry> {
    let mut seen = HashSet::new();
    names
        .iter()
        .filter(|name| seen.insert(name.as_str()))
        .map(|name| BookmarkEntry::Named { name: name.clone() })
        .collect()
}

fn detailed(info: &StableInfo, latest: Option<&CommitRef>, removable: bool) -> BookmarkEntry {
    BookmarkEntry::Detailed {
        info: info.clone(),
        newer_than_latest: is_newer_than_latest(info, latest),
        removable,
    }
}
