// keg-core/src/install/bottle/select.rs
// Bottle-versus-source decision for one formula on this host.

use std::path::Path;

use keg_common::model::formula::{BottleDescriptor, CellarPolicy, Formula};
use keg_common::model::platform::PlatformTag;
use keg_common::pipeline::ArtifactChoice;
use tracing::debug;

/// Whether `bottle` can be poured into `cellar`.
pub fn bottle_usable_in(bottle: &BottleDescriptor, cellar: &Path) -> bool {
    match &bottle.cellar {
        CellarPolicy::Any | CellarPolicy::AnySkipRelocation => true,
        CellarPolicy::Path(p) => Path::new(p) == cellar,
    }
}

/// The bottle that would be poured for `host`, if any: exact tag match,
/// highest rebuild first, skipping bottles bound to another cellar or
/// lacking a download location.
pub fn best_bottle<'f>(
    formula: &'f Formula,
    host: &PlatformTag,
    cellar: &Path,
) -> Option<&'f BottleDescriptor> {
    if host.is_unknown() {
        debug!(
            "Could not reliably determine current platform ('{}'). No bottle for {}.",
            host,
            formula.name()
        );
        return None;
    }
    for bottle in formula.bottles_for(host) {
        if !bottle_usable_in(bottle, cellar) {
            debug!(
                "Bottle {} of {} needs cellar {}, local cellar is {}",
                bottle.platform_tag,
                formula.name(),
                bottle.cellar,
                cellar.display()
            );
            continue;
        }
        if formula.bottle_url(bottle).is_none() {
            debug!(
                "Bottle {} of {} has neither a url nor a root url",
                bottle.platform_tag,
                formula.name()
            );
            continue;
        }
        return Some(bottle);
    }
    None
}

/// Chooses the artifact to install. `force_source` and the formula's own
/// `force_source` always win over an available bottle.
pub fn select_artifact(
    formula: &Formula,
    host: &PlatformTag,
    force_source: bool,
    cellar: &Path,
) -> ArtifactChoice {
    if force_source || formula.force_source {
        debug!("Source build forced for {}", formula.name());
        return ArtifactChoice::Source;
    }
    match best_bottle(formula, host, cellar) {
        Some(bottle) => {
            debug!(
                "Selected bottle {} (rebuild {}) for {}",
                bottle.platform_tag,
                bottle.rebuild,
                formula.name()
            );
            ArtifactChoice::Bottle(bottle.clone())
        }
        None => {
            debug!(
                "No usable bottle for {} on {}; building from source",
                formula.name(),
                host
            );
            ArtifactChoice::Source
        }
    }
}
