//! NIP-65 outbox planning.
//!
//! Relay-list events (kind:10002) tell us where each author writes and
//! reads. From those declarations we derive two tables: where to *find*
//! an author's events, and where to *reach* an author with ours. Plans
//! built on top of the tables claim each target pubkey for exactly one
//! relay, so fanning a request out never duplicates work.

use std::collections::BTreeSet;

use hashbrown::{HashMap, HashSet};
use tracing::debug;

use crate::relay::config::normalize_relay_url;
use crate::{Event, Filter};

/// Routing tables built from relay-list declarations.
///
/// An unmarked `["r", url]` tag counts for both tables; `"write"` only
/// for find-events, `"read"` only for reach-users. Tags with unknown
/// markers or extra elements are ignored entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreferredRelays {
    /// relay url to the authors that publish there
    pub find_events_relays: HashMap<String, HashSet<String>>,
    /// relay url to the authors that read from there
    pub reach_user_relays: HashMap<String, HashSet<String>>,
}

impl PreferredRelays {
    /// Aggregate relay-list events, skipping any relay in `ignoring`.
    /// Urls are normalized before use so spelling variants collapse into
    /// one entry.
    pub fn from_events(relay_list_events: &[Event], ignoring: &BTreeSet<String>) -> Self {
        let mut find_events_relays: HashMap<String, HashSet<String>> = HashMap::new();
        let mut reach_user_relays: HashMap<String, HashSet<String>> = HashMap::new();

        for event in relay_list_events {
            for tag in &event.tags {
                if tag.len() < 2 || tag[0] != "r" {
                    continue;
                }
                let (write, read) = match tag.len() {
                    2 => (true, true),
                    3 => match tag[2].as_str() {
                        "write" => (true, false),
                        "read" => (false, true),
                        _ => (false, false),
                    },
                    _ => (false, false),
                };
                if !write && !read {
                    continue;
                }

                let url = normalize_relay_url(&tag[1]);
                if ignoring.contains(&url) {
                    continue;
                }

                if write {
                    find_events_relays
                        .entry(url.clone())
                        .or_default()
                        .insert(event.pubkey.clone());
                }
                if read {
                    reach_user_relays
                        .entry(url)
                        .or_default()
                        .insert(event.pubkey.clone());
                }
            }
        }

        PreferredRelays {
            find_events_relays,
            reach_user_relays,
        }
    }
}

/// One relay's slice of a fanned-out request: the authors it was chosen
/// to cover and the original filters narrowed down to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindEventsRequest {
    pub pubkeys: HashSet<String>,
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPlan {
    pub original_request: Vec<Filter>,
    pub find_events_requests: HashMap<String, FindEventsRequest>,
}

impl RequestPlan {
    /// Decide which relay serves which of the requested authors.
    ///
    /// Relays already in `our_read_relays` are left out since they get
    /// the unscoped request anyway. The remaining candidates are ranked
    /// by how many of the requested authors they cover (ties break on
    /// url), the top `skip_top_relays` are dropped, and each relay then
    /// claims whatever targets no better-ranked relay took. Every author
    /// ends up claimed by at most one relay.
    pub fn build(
        pubkeys: &HashSet<String>,
        req_filters: &[Filter],
        our_read_relays: &BTreeSet<String>,
        preferred: &PreferredRelays,
        skip_top_relays: usize,
    ) -> Self {
        let mut candidates: Vec<(&str, Vec<&str>)> = preferred
            .find_events_relays
            .iter()
            .filter(|(url, _)| !our_read_relays.contains(url.as_str()))
            .map(|(url, relay_pubkeys)| {
                let overlap: Vec<&str> = relay_pubkeys
                    .iter()
                    .filter(|pk| pubkeys.contains(pk.as_str()))
                    .map(String::as_str)
                    .collect();
                (url.as_str(), overlap)
            })
            .filter(|(_, overlap)| !overlap.is_empty())
            .collect();

        candidates.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(b.0)));

        let mut find_events_requests: HashMap<String, FindEventsRequest> = HashMap::new();
        let mut accounted: HashSet<String> = HashSet::new();

        for (url, overlap) in candidates.into_iter().skip(skip_top_relays) {
            let mut claimed: Vec<String> = overlap
                .into_iter()
                .filter(|pk| !accounted.contains(*pk))
                .map(str::to_string)
                .collect();
            if claimed.is_empty() {
                continue;
            }
            // stable authors order on the wire
            claimed.sort_unstable();

            let filters: Vec<Filter> = req_filters
                .iter()
                .map(|filter| {
                    let mut scoped = filter.clone();
                    scoped.authors = Some(claimed.clone());
                    scoped
                })
                .collect();

            accounted.extend(claimed.iter().cloned());
            find_events_requests.insert(
                url.to_string(),
                FindEventsRequest {
                    pubkeys: claimed.into_iter().collect(),
                    filters,
                },
            );
        }

        debug!(
            "request plan: {} relay-scoped requests covering {} of {} authors",
            find_events_requests.len(),
            accounted.len(),
            pubkeys.len()
        );

        RequestPlan {
            original_request: req_filters.to_vec(),
            find_events_requests,
        }
    }
}

/// Which extra relays should receive a published event so the people
/// p-tagged in it actually see it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WritePlan {
    /// relay url to the tagged readers it covers
    pub relays: HashMap<String, HashSet<String>>,
}

impl WritePlan {
    /// Same claiming scheme as [`RequestPlan::build`], but over the
    /// reach-users table and without skipping top relays.
    pub fn build(
        pubkeys: &HashSet<String>,
        our_write_relays: &BTreeSet<String>,
        preferred: &PreferredRelays,
    ) -> Self {
        let mut candidates: Vec<(&str, Vec<&str>)> = preferred
            .reach_user_relays
            .iter()
            .filter(|(url, _)| !our_write_relays.contains(url.as_str()))
            .map(|(url, relay_pubkeys)| {
                let overlap: Vec<&str> = relay_pubkeys
                    .iter()
                    .filter(|pk| pubkeys.contains(pk.as_str()))
                    .map(String::as_str)
                    .collect();
                (url.as_str(), overlap)
            })
            .filter(|(_, overlap)| !overlap.is_empty())
            .collect();

        candidates.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(b.0)));

        let mut relays: HashMap<String, HashSet<String>> = HashMap::new();
        let mut accounted: HashSet<String> = HashSet::new();

        for (url, overlap) in candidates {
            let claimed: HashSet<String> = overlap
                .into_iter()
                .filter(|pk| !accounted.contains(*pk))
                .map(str::to_string)
                .collect();
            if claimed.is_empty() {
                continue;
            }
            accounted.extend(claimed.iter().cloned());
            relays.insert(url.to_string(), claimed);
        }

        debug!(
            "write plan: {} relays reach {} of {} tagged readers",
            relays.len(),
            accounted.len(),
            pubkeys.len()
        );

        WritePlan { relays }
    }
}
