//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! Walking a channel forward from an installed CSV.

use crate::catalog::{Bundle, Catalog, Result};
use tracing::trace;

/// The next bundle to install on top of `installed` in the given channel.
///
/// Candidates are the channel bundles newer than `installed` in chain order
/// that can replace it directly through `replaces`, `skips` or `skipRange`.
/// The one closest to the channel head wins, so a skip edge on the head lets
/// an old install jump straight to it. Returns `None` when `installed` is the
/// head or nothing in the channel can replace it.
pub fn next_upgrade<'c>(
    catalog: &'c Catalog,
    package: &str,
    channel: &str,
    installed: &Bundle,
) -> Result<Option<&'c Bundle>> {
    let chain = catalog.channel_bundles(package, channel)?;
    for bundle in chain {
        if bundle.name == installed.name {
            break;
        }
        if bundle.can_replace(&installed.name, Some(&installed.version)) {
            trace!(package, from = %installed.name, to = %bundle.name, "found upgrade");
            return Ok(Some(bundle));
        }
    }
    Ok(None)
}
