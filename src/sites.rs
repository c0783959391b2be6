// Location resolution and site filtering. Both run once per run; the
// working site list does not change across passes except for permanent
// site removals handled by the acquisition loop.

use tracing::{debug, warn};

use crate::backend::{BookingBackend, ResolveError};
use crate::constraints::{ConstraintSet, LocationQuery};
use crate::model::{GeoPoint, Site};

/// Expands location queries into site candidates, deduplicated by id and
/// preserving first-seen order across queries. A query that resolves
/// nothing is reported but does not fail the whole resolution.
pub async fn resolve_sites(
    backend: &dyn BookingBackend,
    queries: &[LocationQuery],
) -> (Vec<Site>, Vec<ResolveError>) {
    let mut sites: Vec<Site> = Vec::new();
    let mut failures = Vec::new();

    for query in queries {
        match backend.resolve_locations(query).await {
            Ok(resolved) => {
                for site in resolved {
                    if sites.iter().any(|s| s.id == site.id) {
                        continue;
                    }
                    sites.push(site);
                }
            }
            Err(err) => {
                warn!(query = %query.name, error = %err, "location query failed");
                failures.push(err);
            }
        }
    }

    (sites, failures)
}

/// Pure conjunctive filter over the resolved candidates:
/// include list/regex, then exclude list/regex, then postal code.
pub fn filter_sites(sites: Vec<Site>, constraints: &ConstraintSet) -> Vec<Site> {
    sites
        .into_iter()
        .filter(|site| {
            if !matches_includes(site, constraints) {
                debug!(site = %site.name, "dropped: not on include list");
                return false;
            }
            if matches_excludes(site, constraints) {
                debug!(site = %site.name, "dropped: excluded");
                return false;
            }
            if let Some(postal) = &constraints.postal_filter {
                if &site.postal_code != postal {
                    debug!(site = %site.name, postal = %site.postal_code, "dropped: postal mismatch");
                    return false;
                }
            }
            true
        })
        .collect()
}

/// Orders the working list nearest-first relative to the given starting
/// point, so an equally early slot at a closer site is tried first.
/// Sites without coordinates sort last, keeping their relative order.
pub fn order_sites(sites: &mut [Site], origin: &GeoPoint) {
    sites.sort_by(|a, b| {
        let rank = |s: &Site| {
            s.location
                .as_ref()
                .map_or(f64::INFINITY, |l| origin.distance_km(l))
        };
        rank(a).total_cmp(&rank(b))
    });
}

fn matches_includes(site: &Site, constraints: &ConstraintSet) -> bool {
    let has_list = !constraints.site_include.is_empty();
    let has_regex = constraints.site_include_regex.is_some();
    if !has_list && !has_regex {
        return true;
    }

    if constraints.site_include.iter().any(|n| n == &site.name) {
        return true;
    }
    constraints
        .site_include_regex
        .as_ref()
        .is_some_and(|re| re.is_match(&site.name))
}

fn matches_excludes(site: &Site, constraints: &ConstraintSet) -> bool {
    if constraints.site_exclude.iter().any(|n| n == &site.name) {
        return true;
    }
    constraints
        .site_exclude_regex
        .as_ref()
        .is_some_and(|re| re.is_match(&site.name))
}
