//! In-memory kernel used by unit tests. Namespace 0 is the host, 1 the pod.
//! Link indices are unique across namespaces so moved links keep theirs.

use crate::networking::error::{NetworkError, NetworkResult};
use crate::networking::netlink::{
    Address, IpFamily, Link, Neighbour, Netlink, Route, Rule, RT_TABLE_LOCAL, RT_TABLE_MAIN,
};
use async_trait::async_trait;
use ipnet::IpNet;
use macaddr::MacAddr6;
use netlink_packet_route::route::RouteScope;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};

pub const HOST: usize = 0;
pub const POD: usize = 1;

#[derive(Debug, Clone, Default)]
pub struct Namespace {
    pub links: Vec<Link>,
    pub up: Vec<u32>,
    pub addresses: Vec<Address>,
    pub routes: Vec<Route>,
    pub rules: Vec<Rule>,
    pub neighbours: Vec<Neighbour>,
}

impl Namespace {
    pub fn link(&self, name: &str) -> Option<&Link> {
        self.links.iter().find(|l| l.name == name)
    }

    pub fn routes_in(&self, table: u32) -> Vec<&Route> {
        self.routes.iter().filter(|r| r.table == table).collect()
    }
}

struct World {
    namespaces: Vec<Namespace>,
    next_index: u32,
    failures: Vec<(usize, &'static str, i32)>,
}

#[derive(Clone)]
pub struct FakeKernel {
    world: Arc<Mutex<World>>,
}

pub struct FakeNetlink {
    world: Arc<Mutex<World>>,
    ns: usize,
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeKernel {
    pub fn new() -> Self {
        let world = World {
            namespaces: vec![Namespace::default(), Namespace::default()],
            next_index: 10,
            failures: Vec::new(),
        };
        let kernel = Self {
            world: Arc::new(Mutex::new(world)),
        };
        kernel.add_link(HOST, "lo", None);
        kernel.add_link(POD, "lo", None);
        kernel
    }

    fn lock(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap()
    }

    pub fn host(&self) -> FakeNetlink {
        FakeNetlink { world: Arc::clone(&self.world), ns: HOST }
    }

    pub fn pod(&self) -> FakeNetlink {
        FakeNetlink { world: Arc::clone(&self.world), ns: POD }
    }

    pub fn snapshot(&self, ns: usize) -> Namespace {
        self.lock().namespaces[ns].clone()
    }

    pub fn add_link(&self, ns: usize, name: &str, mac: Option<&str>) -> u32 {
        let mut world = self.lock();
        let index = world.next_index;
        world.next_index += 1;
        let mac = mac.map(|m| m.parse().unwrap()).or(Some(mac_for(index)));
        world.namespaces[ns].links.push(Link {
            index,
            name: name.to_string(),
            mac,
            parent_index: None,
        });
        index
    }

    /// Assign an address plus the local and connected routes the kernel would add.
    pub fn add_address(&self, ns: usize, link_index: u32, cidr: &str) {
        let net: IpNet = cidr.parse().unwrap();
        let ip = net.addr();
        let family = IpFamily::of(&ip);
        let mut world = self.lock();
        let space = &mut world.namespaces[ns];
        space.addresses.push(Address {
            ip,
            prefix_len: net.prefix_len(),
            link_index,
        });

        let mut local = Route::unicast(family, RT_TABLE_LOCAL);
        local.destination = Some(crate::networking::address::max_mask_net(ip));
        local.oif = Some(link_index);
        local.pref_src = Some(ip);
        local.scope = RouteScope::Host;
        space.routes.push(local);

        if net.prefix_len() < net.max_prefix_len() {
            let mut connected = Route::unicast(family, RT_TABLE_MAIN);
            connected.destination = Some(net.trunc());
            connected.oif = Some(link_index);
            connected.pref_src = Some(ip);
            connected.scope = RouteScope::Link;
            space.routes.push(connected);
        }
    }

    pub fn add_route(&self, ns: usize, route: Route) {
        self.lock().namespaces[ns].routes.push(route);
    }

    /// Make the next `op` in `ns` fail with `errno`.
    pub fn fail_next(&self, ns: usize, op: &'static str, errno: i32) {
        self.lock().failures.push((ns, op, errno));
    }
}

fn mac_for(index: u32) -> MacAddr6 {
    let b = index.to_be_bytes();
    MacAddr6::new(0x02, 0xfe, b[0], b[1], b[2], b[3])
}

fn enodev(what: impl std::fmt::Display) -> NetworkError {
    NetworkError::kernel(format!("link {}", what), libc::ENODEV)
}

impl FakeNetlink {
    fn with<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut World, usize) -> NetworkResult<T>,
    ) -> NetworkResult<T> {
        let mut world = self.world.lock().unwrap();
        if let Some(pos) = world
            .failures
            .iter()
            .position(|(ns, name, _)| *ns == self.ns && *name == op)
        {
            let (_, _, errno) = world.failures.remove(pos);
            return Err(NetworkError::kernel(op, errno));
        }
        f(&mut world, self.ns)
    }
}

#[async_trait]
impl Netlink for FakeNetlink {
    async fn link_by_name(&self, name: &str) -> NetworkResult<Link> {
        self.with("link_get", |w, ns| {
            w.namespaces[ns]
                .link(name)
                .cloned()
                .ok_or_else(|| NetworkError::NotFound(format!("link {}", name)))
        })
    }

    async fn link_by_index(&self, index: u32) -> NetworkResult<Link> {
        self.with("link_get", |w, ns| {
            w.namespaces[ns]
                .links
                .iter()
                .find(|l| l.index == index)
                .cloned()
                .ok_or_else(|| NetworkError::NotFound(format!("link index {}", index)))
        })
    }

    async fn links(&self) -> NetworkResult<Vec<Link>> {
        self.with("link_list", |w, ns| Ok(w.namespaces[ns].links.clone()))
    }

    async fn link_add_veth(&self, name: &str, peer: &str) -> NetworkResult<()> {
        self.with("link_add", |w, ns| {
            if w.namespaces[ns].link(name).is_some() || w.namespaces[ns].link(peer).is_some() {
                return Err(NetworkError::kernel("add veth", libc::EEXIST));
            }
            let a = w.next_index;
            let b = a + 1;
            w.next_index += 2;
            let space = &mut w.namespaces[ns];
            space.links.push(Link {
                index: a,
                name: name.to_string(),
                mac: Some(mac_for(a)),
                parent_index: Some(b),
            });
            space.links.push(Link {
                index: b,
                name: peer.to_string(),
                mac: Some(mac_for(b)),
                parent_index: Some(a),
            });
            Ok(())
        })
    }

    async fn link_del(&self, index: u32) -> NetworkResult<()> {
        self.with("link_del", |w, ns| {
            let space = &mut w.namespaces[ns];
            let pos = space
                .links
                .iter()
                .position(|l| l.index == index)
                .ok_or_else(|| enodev(index))?;
            let link = space.links.remove(pos);
            // Deleting one end of a veth removes its peer too.
            let peer = link.parent_index;
            for space in w.namespaces.iter_mut() {
                space
                    .links
                    .retain(|l| Some(l.index) != peer || l.parent_index != Some(index));
                space.addresses.retain(|a| a.link_index != index && Some(a.link_index) != peer);
                space
                    .routes
                    .retain(|r| !r.uses_link(index) && peer.map_or(true, |p| !r.uses_link(p)));
            }
            Ok(())
        })
    }

    async fn link_up(&self, index: u32) -> NetworkResult<()> {
        self.with("link_up", |w, ns| {
            let space = &mut w.namespaces[ns];
            if !space.links.iter().any(|l| l.index == index) {
                return Err(enodev(index));
            }
            if !space.up.contains(&index) {
                space.up.push(index);
            }
            Ok(())
        })
    }

    async fn link_set_mac(&self, index: u32, mac: MacAddr6) -> NetworkResult<()> {
        self.with("link_set_mac", |w, ns| {
            let link = w.namespaces[ns]
                .links
                .iter_mut()
                .find(|l| l.index == index)
                .ok_or_else(|| enodev(index))?;
            link.mac = Some(mac);
            Ok(())
        })
    }

    async fn link_set_netns(&self, index: u32, netns_fd: RawFd) -> NetworkResult<()> {
        self.with("link_set_netns", |w, ns| {
            let target = usize::try_from(netns_fd).unwrap();
            let space = &mut w.namespaces[ns];
            let pos = space
                .links
                .iter()
                .position(|l| l.index == index)
                .ok_or_else(|| enodev(index))?;
            let link = space.links.remove(pos);
            space.up.retain(|i| *i != index);
            w.namespaces[target].links.push(link);
            Ok(())
        })
    }

    async fn addresses(&self, link_index: Option<u32>) -> NetworkResult<Vec<Address>> {
        self.with("addr_list", |w, ns| {
            Ok(w.namespaces[ns]
                .addresses
                .iter()
                .filter(|a| link_index.map_or(true, |i| a.link_index == i))
                .cloned()
                .collect())
        })
    }

    async fn routes(&self, family: IpFamily) -> NetworkResult<Vec<Route>> {
        self.with("route_list", |w, ns| {
            Ok(w.namespaces[ns]
                .routes
                .iter()
                .filter(|r| family.includes(r.family))
                .cloned()
                .collect())
        })
    }

    async fn route_add(&self, route: &Route) -> NetworkResult<()> {
        self.with("route_add", |w, ns| {
            let space = &mut w.namespaces[ns];
            if let Some(oif) = route.oif {
                if !space.links.iter().any(|l| l.index == oif) {
                    return Err(enodev(oif));
                }
            }
            let exists = space.routes.iter().any(|r| {
                r.family == route.family
                    && r.table == route.table
                    && r.destination == route.destination
                    && r.priority == route.priority
            });
            if exists {
                return Err(NetworkError::kernel("add route", libc::EEXIST));
            }
            space.routes.push(route.clone());
            Ok(())
        })
    }

    async fn route_del(&self, route: &Route) -> NetworkResult<()> {
        self.with("route_del", |w, ns| {
            let space = &mut w.namespaces[ns];
            let pos = space
                .routes
                .iter()
                .position(|r| {
                    r.family == route.family
                        && r.table == route.table
                        && r.destination == route.destination
                        && route.oif.map_or(true, |oif| r.uses_link(oif))
                })
                .ok_or_else(|| NetworkError::kernel("delete route", libc::ESRCH))?;
            space.routes.remove(pos);
            Ok(())
        })
    }

    async fn rules(&self, family: IpFamily) -> NetworkResult<Vec<Rule>> {
        self.with("rule_list", |w, ns| {
            Ok(w.namespaces[ns]
                .rules
                .iter()
                .filter(|r| family.includes(r.family))
                .cloned()
                .collect())
        })
    }

    async fn rule_add(&self, rule: &Rule) -> NetworkResult<()> {
        self.with("rule_add", |w, ns| {
            let space = &mut w.namespaces[ns];
            if space.rules.iter().any(|r| same_rule(r, rule)) {
                return Err(NetworkError::kernel("add rule", libc::EEXIST));
            }
            space.rules.push(rule.clone());
            Ok(())
        })
    }

    async fn rule_del(&self, rule: &Rule) -> NetworkResult<()> {
        self.with("rule_del", |w, ns| {
            let space = &mut w.namespaces[ns];
            let pos = space
                .rules
                .iter()
                .position(|r| same_rule(r, rule))
                .ok_or_else(|| NetworkError::kernel("delete rule", libc::ENOENT))?;
            space.rules.remove(pos);
            Ok(())
        })
    }

    async fn neighbours(&self) -> NetworkResult<Vec<Neighbour>> {
        self.with("neigh_list", |w, ns| Ok(w.namespaces[ns].neighbours.clone()))
    }

    async fn neighbour_add(&self, neigh: &Neighbour) -> NetworkResult<()> {
        self.with("neigh_add", |w, ns| {
            let space = &mut w.namespaces[ns];
            if space
                .neighbours
                .iter()
                .any(|n| n.link_index == neigh.link_index && n.ip == neigh.ip)
            {
                return Err(NetworkError::kernel("add neighbour", libc::EEXIST));
            }
            space.neighbours.push(neigh.clone());
            Ok(())
        })
    }

    async fn neighbour_del(&self, neigh: &Neighbour) -> NetworkResult<()> {
        self.with("neigh_del", |w, ns| {
            let space = &mut w.namespaces[ns];
            let pos = space
                .neighbours
                .iter()
                .position(|n| n.link_index == neigh.link_index && n.ip == neigh.ip)
                .ok_or_else(|| NetworkError::kernel("delete neighbour", libc::ENOENT))?;
            space.neighbours.remove(pos);
            Ok(())
        })
    }
}

fn same_rule(existing: &Rule, wanted: &Rule) -> bool {
    existing.family == wanted.family
        && existing.src == wanted.src
        && existing.dst == wanted.dst
        && existing.table == wanted.table
        && wanted.priority.map_or(true, |p| existing.priority == Some(p))
}
