use crate::networking::error::{NetworkError, NetworkResult};
use crate::networking::netlink::{IpFamily, Netlink, Route, RT_TABLE_MAIN};
use ipnet::IpNet;
use netlink_packet_route::route::RouteScope;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Add `dst` via `device` into `table`. A gateway is attached when one of
/// the matching family is given. An already-present route is success.
#[allow(clippy::too_many_arguments)]
pub async fn add_route<N: Netlink + ?Sized>(
    nl: &N,
    table: u32,
    scope: RouteScope,
    device: &str,
    src: Option<IpAddr>,
    dst: IpNet,
    v4_gw: Option<Ipv4Addr>,
    v6_gw: Option<Ipv6Addr>,
) -> NetworkResult<()> {
    let link = nl.link_by_name(device).await?;
    let family = IpFamily::of(&dst.addr());

    let mut route = Route::unicast(family, table);
    route.scope = scope;
    route.oif = Some(link.index);
    route.pref_src = src.filter(|s| IpFamily::of(s) == family);
    route.destination = (dst.prefix_len() > 0).then_some(dst);
    route.gateway = match dst {
        IpNet::V4(_) => v4_gw.map(IpAddr::V4),
        IpNet::V6(_) => v6_gw.map(IpAddr::V6),
    };

    match nl.route_add(&route).await {
        Ok(()) => {
            tracing::debug!(%dst, table, device, "route added");
            Ok(())
        }
        Err(e) if e.is_exists() => {
            tracing::debug!(%dst, table, device, "route already present");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn is_v6_link_local_net(dst: &Option<IpNet>) -> bool {
    matches!(dst, Some(IpNet::V6(net)) if net.prefix_len() == 64
        && net.addr().segments()[..4] == [0xfe80, 0, 0, 0])
}

/// Move every route of `device` in `src_table` into `dst_table`.
/// Link-local fe80::/64 stays put. IPv6 default routes also match when
/// `device` is only one leg of a multipath route.
pub async fn move_route_table<N: Netlink + ?Sized>(
    nl: &N,
    device: &str,
    src_table: u32,
    dst_table: u32,
    family: IpFamily,
) -> NetworkResult<()> {
    let link = nl.link_by_name(device).await?;
    let routes = nl.routes(family).await?;

    for route in routes.into_iter().filter(|r| r.table == src_table) {
        if is_v6_link_local_net(&route.destination) {
            continue;
        }
        let matches = route.oif == Some(link.index)
            || (route.family == IpFamily::V6 && route.is_default() && route.uses_link(link.index));
        if !matches {
            continue;
        }

        match nl.route_del(&route).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let mut moved = route;
        moved.table = dst_table;
        match nl.route_add(&moved).await {
            Ok(()) => {}
            Err(e) if e.is_exists() => {}
            Err(e) => return Err(e),
        }
        tracing::debug!(
            device,
            src_table,
            dst_table,
            dst = %moved.destination.map_or_else(|| "default".to_string(), |d| d.to_string()),
            "route moved"
        );
    }
    Ok(())
}

/// Device of the main table's default route, skipping `skip`.
pub async fn default_route_interface<N: Netlink + ?Sized>(
    nl: &N,
    skip: Option<&str>,
    family: IpFamily,
) -> NetworkResult<String> {
    let routes = nl.routes(family).await?;
    for route in routes
        .iter()
        .filter(|r| r.table == RT_TABLE_MAIN && r.is_default())
    {
        let oifs = route
            .oif
            .into_iter()
            .chain(route.multipath.iter().map(|nh| nh.oif));
        for oif in oifs {
            let link = nl.link_by_index(oif).await?;
            if skip != Some(link.name.as_str()) {
                return Ok(link.name);
            }
        }
    }
    Err(NetworkError::NotFound(format!(
        "default route interface (excluding {})",
        skip.unwrap_or("none")
    )))
}

/// Non-default routes of `device` in `table`.
pub async fn routes_of_device<N: Netlink + ?Sized>(
    nl: &N,
    device: &str,
    table: u32,
    family: IpFamily,
) -> NetworkResult<Vec<Route>> {
    let link = nl.link_by_name(device).await?;
    Ok(nl
        .routes(family)
        .await?
        .into_iter()
        .filter(|r| r.table == table && r.oif == Some(link.index) && !r.is_default())
        .collect())
}

/// Drop routes for exactly `dst` in `table` that egress anywhere but
/// `keep_oif`. The route already on `keep_oif` stays, so a rerun never
/// leaves `dst` unreachable in between.
pub async fn delete_stale_routes_to<N: Netlink + ?Sized>(
    nl: &N,
    table: u32,
    dst: IpNet,
    keep_oif: u32,
) -> NetworkResult<()> {
    let family = IpFamily::of(&dst.addr());
    for route in nl.routes(family).await? {
        if route.table == table && route.destination == Some(dst) && route.oif != Some(keep_oif) {
            tracing::debug!(%dst, table, oif = ?route.oif, "dropping stale route");
            match nl.route_del(&route).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}
