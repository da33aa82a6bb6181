//! Whitelist indexing and resolution.
//!
//! At compile time every BasicRule is aggregated into one of three shapes:
//! per-zone hashtables keyed by a composed `[#]uri#name` string, a linear
//! list of regex-match-zone whitelists, or the globally-disabled list.
//! At scan time [`is_rule_whitelisted`] decides whether a pattern hit
//! survives.

use tracing::{debug, warn};

use crate::types::{HttpRule, LocationKind, MatchZone, RuleSet, WhitelistEntry};

/// Aggregate the parsed whitelist rules into the rule set's indexes.
pub(crate) fn build_index(whitelist_rules: Vec<HttpRule>, rules: &mut RuleSet) {
    let mut merged: Vec<WhitelistEntry> = Vec::new();

    for mut wl in whitelist_rules {
        // no custom location at all means the listed IDs are disabled
        if wl.mz.locations.is_empty() {
            rules.disabled_rules.push(wl);
            continue;
        }

        let (zone, uri_idx, name_idx) = match identify(&wl) {
            Some(identified) => identified,
            None => continue,
        };
        wl.mz.zone = zone;

        // regex match zones can't be hashed; they are walked at runtime
        if wl.mz.rx_mz {
            rules.rxmz_whitelists.push(wl);
            continue;
        }

        let key = match compose_key(&wl, uri_idx, name_idx) {
            Some(key) => key,
            None => {
                warn!(ids = ?wl.wl_ids, "Whitelist has no usable location, skipped");
                continue;
            }
        };
        let uri_only = uri_idx.is_some() && name_idx.is_none();

        match merged
            .iter_mut()
            .find(|entry| entry.name == key && entry.zone == zone)
        {
            Some(entry) => entry.ids.extend_from_slice(&wl.wl_ids),
            None => merged.push(WhitelistEntry {
                name: key,
                zone,
                ids: wl.wl_ids.clone(),
                uri_only,
                target_name: wl.mz.target_name,
            }),
        }
    }

    for entry in merged {
        let hash = match entry.zone.fold() {
            MatchZone::Body => &mut rules.wl_body,
            MatchZone::Headers => &mut rules.wl_headers,
            MatchZone::Url => &mut rules.wl_url,
            MatchZone::Args => &mut rules.wl_args,
            _ => {
                warn!(key = %entry.name, "Whitelist with unresolved zone dropped");
                continue;
            }
        };
        debug!(zone = %entry.zone, key = %entry.name, ids = ?entry.ids, "Whitelist indexed");
        hash.insert(entry.name.clone(), entry);
    }
}

/// Resolve the whitelist's single zone and its uri/name location indexes.
///
/// Returns None for the configuration error of targeting more than one
/// variable-name location.
fn identify(wl: &HttpRule) -> Option<(MatchZone, Option<usize>, Option<usize>)> {
    let mz = &wl.mz;
    let mut zone = if mz.body || mz.body_var {
        MatchZone::Body
    } else if mz.headers || mz.headers_var {
        MatchZone::Headers
    } else if mz.args || mz.args_var {
        MatchZone::Args
    } else if mz.url {
        MatchZone::Url
    } else if mz.file_ext {
        MatchZone::FileExt
    } else {
        MatchZone::Unknown
    };

    let mut uri_idx = None;
    let mut name_idx = None;

    for (i, loc) in mz.locations.iter().enumerate() {
        let forced = match loc.kind {
            LocationKind::Url => {
                uri_idx = Some(i);
                continue;
            }
            LocationKind::BodyVar => MatchZone::Body,
            LocationKind::HeadersVar => MatchZone::Headers,
            LocationKind::ArgsVar => MatchZone::Args,
        };
        if name_idx.is_some() {
            warn!(ids = ?wl.wl_ids, "Whitelist can't target more than one variable, skipped");
            return None;
        }
        name_idx = Some(i);
        zone = forced;
    }

    // a lone $URL narrowing belongs to the URL hash
    if zone == MatchZone::Unknown && uri_idx.is_some() {
        zone = MatchZone::Url;
    }

    Some((zone, uri_idx, name_idx))
}

/// Compose the hashtable key: `#` prefix when the whitelist targets
/// variable names, then `uri#name`, `uri` or `name`.
fn compose_key(wl: &HttpRule, uri_idx: Option<usize>, name_idx: Option<usize>) -> Option<String> {
    let lit = |i: usize| wl.mz.locations[i].literal().unwrap_or_default();

    let mut key = String::new();
    if wl.mz.target_name {
        key.push('#');
    }
    match (uri_idx, name_idx) {
        (Some(u), Some(n)) => {
            key.push_str(lit(u));
            key.push('#');
            key.push_str(lit(n));
        }
        (Some(u), None) => key.push_str(lit(u)),
        (None, Some(n)) => key.push_str(lit(n)),
        (None, None) => return None,
    }
    Some(key)
}

/// Does a whitelist id list cover the matched rule id?
///
/// `0` matches everything (historical quirk, kept on purpose). A negative
/// id flips the predicate for non-internal rules (id >= 1000): everything
/// matches except the explicitly negated ids.
pub fn check_ids(match_id: u32, wl_ids: &[i32]) -> bool {
    let mut negative = false;

    for &wl_id in wl_ids {
        if wl_id == match_id as i32 {
            return true;
        }
        if wl_id == 0 {
            return true;
        }
        if wl_id < 0 && match_id >= 1000 {
            negative = true;
            if match_id as i32 == -wl_id {
                return false;
            }
        }
    }

    negative
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchType {
    NameOnly,
    UriOnly,
    Mixed,
}

/// Does a hashtable entry apply to this candidate?
fn accepts(
    wl: &WhitelistEntry,
    zone: MatchZone,
    rule: &HttpRule,
    ty: MatchType,
    target_name: bool,
) -> bool {
    if wl.target_name != target_name {
        return false;
    }

    match ty {
        MatchType::NameOnly => {
            // a name hit must not be satisfied by a URL-only whitelist,
            // lest an argument named like a URI slips through
            if zone.fold() != wl.zone.fold() || wl.uri_only {
                return false;
            }
        }
        MatchType::UriOnly | MatchType::Mixed => {
            if wl.uri_only && ty != MatchType::UriOnly {
                return false;
            }
            if zone.fold() != wl.zone.fold() {
                return false;
            }
        }
    }

    check_ids(rule.id, &wl.ids)
}

fn find_in_hash<'a>(rules: &'a RuleSet, key: &str, zone: MatchZone) -> Option<&'a WhitelistEntry> {
    rules.whitelist_hash(zone)?.get(key)
}

/// Decide whether a rule hit is excluded by the whitelist corpus.
///
/// `name` is the matched variable's name (empty for URL hits), `zone` the
/// zone the hit occurred in, `target_name` whether the pattern matched the
/// variable's name rather than its value.
pub fn is_rule_whitelisted(
    rules: &RuleSet,
    uri: &str,
    rule: &HttpRule,
    name: &str,
    zone: MatchZone,
    target_name: bool,
) -> bool {
    // globally disabled rules first
    for disabled in &rules.disabled_rules {
        if !check_ids(rule.id, &disabled.wl_ids) {
            continue;
        }
        if !disabled.has_mz {
            return true;
        }
        // a zone block targeting nothing disables everywhere
        if !disabled.mz.has_coarse_zone() {
            return true;
        }
        if target_name != disabled.mz.target_name {
            continue;
        }
        let disabled_here = match zone {
            MatchZone::Args => disabled.mz.args,
            MatchZone::Headers => disabled.mz.headers,
            MatchZone::Body => disabled.mz.body,
            MatchZone::FileExt => disabled.mz.file_ext,
            MatchZone::Url => disabled.mz.url,
            MatchZone::Unknown => false,
        };
        if disabled_here {
            debug!(rule_id = rule.id, zone = %zone, "Rule disabled in zone");
            return true;
        }
    }

    let name = name.to_lowercase();
    let uri = uri.to_lowercase();

    // $X_VAR:name(|NAME) whitelists: (name) or (#name)
    if !name.is_empty() {
        if let Some(wl) = find_in_hash(rules, &name, zone) {
            if accepts(wl, zone, rule, MatchType::NameOnly, target_name) {
                return true;
            }
        }
        let hashed = format!("#{name}");
        if let Some(wl) = find_in_hash(rules, &hashed, zone) {
            if accepts(wl, zone, rule, MatchType::NameOnly, target_name) {
                return true;
            }
        }
    }

    // plain URI whitelists apply whatever zone the hit came from
    if let Some(wl) = rules.wl_url.get(&uri) {
        if accepts(wl, wl.zone, rule, MatchType::UriOnly, target_name) {
            return true;
        }
    }

    // $URL:x scoped to this zone: (uri) then (#uri)
    if let Some(wl) = find_in_hash(rules, &uri, zone) {
        if accepts(wl, zone, rule, MatchType::UriOnly, target_name) {
            return true;
        }
    }
    let hashed_uri = format!("#{uri}");
    if let Some(wl) = find_in_hash(rules, &hashed_uri, zone) {
        if accepts(wl, zone, rule, MatchType::UriOnly, target_name) {
            return true;
        }
    }

    // $URL:x|$X_VAR:y combinations: (uri#name) or (#uri#name)
    let mixed = if target_name {
        format!("#{uri}#{name}")
    } else {
        format!("{uri}#{name}")
    };
    if let Some(wl) = find_in_hash(rules, &mixed, zone) {
        if accepts(wl, zone, rule, MatchType::Mixed, target_name) {
            return true;
        }
    }

    whitelisted_by_rx(rules, &uri, rule, &name, zone, target_name)
}

/// Walk the regex-match-zone whitelists; every custom location must match
/// its candidate (the URI for `$URL_X`, the variable name otherwise).
fn whitelisted_by_rx(
    rules: &RuleSet,
    uri: &str,
    rule: &HttpRule,
    name: &str,
    zone: MatchZone,
    target_name: bool,
) -> bool {
    if rules.rxmz_whitelists.is_empty() {
        return false;
    }

    for wl in &rules.rxmz_whitelists {
        if !wl.has_mz || wl.mz.locations.is_empty() {
            debug!(ids = ?wl.wl_ids, "Regex whitelist without custom location, ignored");
            continue;
        }
        if wl.mz.zone.fold() != zone.fold() {
            continue;
        }
        if wl.mz.target_name != target_name {
            continue;
        }

        let all_match = wl.mz.locations.iter().all(|loc| {
            let candidate = match loc.kind {
                LocationKind::Url => uri,
                _ => name,
            };
            loc.matches(candidate)
        });

        if all_match && check_ids(rule.id, &wl.wl_ids) {
            debug!(rule_id = rule.id, "Whitelisted by regex match zone");
            return true;
        }
    }

    false
}
