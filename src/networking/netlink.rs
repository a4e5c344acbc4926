use crate::networking::error::{NetworkError, NetworkResult};
use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::IpNet;
use macaddr::MacAddr6;
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use netlink_packet_route::neighbour::{
    NeighbourAddress, NeighbourAttribute, NeighbourMessage, NeighbourState,
};
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteNextHop, RouteProtocol, RouteScope,
    RouteType,
};
use netlink_packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};
use netlink_packet_route::AddressFamily;
use rtnetlink::{IpVersion, LinkUnspec, LinkVeth};
use std::net::IpAddr;
use std::os::unix::io::RawFd;

pub const RT_TABLE_MAIN: u32 = 254;
pub const RT_TABLE_LOCAL: u32 = 255;

/// Address family selector used by every dump and by the mode resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
    All,
}

impl IpFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    /// True if an address of `other`'s family is covered by this selector.
    pub fn includes(self, other: IpFamily) -> bool {
        self == IpFamily::All || self == other
    }

    pub fn has_v4(self) -> bool {
        self.includes(IpFamily::V4)
    }

    pub fn has_v6(self) -> bool {
        self.includes(IpFamily::V6)
    }

    fn versions(self) -> &'static [IpVersion] {
        match self {
            IpFamily::V4 => &[IpVersion::V4],
            IpFamily::V6 => &[IpVersion::V6],
            IpFamily::All => &[IpVersion::V4, IpVersion::V6],
        }
    }

    fn address_family(self) -> AddressFamily {
        match self {
            IpFamily::V6 => AddressFamily::Inet6,
            _ => AddressFamily::Inet,
        }
    }

    fn from_address_family(af: AddressFamily) -> Option<Self> {
        match af {
            AddressFamily::Inet => Some(IpFamily::V4),
            AddressFamily::Inet6 => Some(IpFamily::V6),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub mac: Option<MacAddr6>,
    /// IFLA_LINK: for a veth this is the peer's index in the peer's namespace.
    pub parent_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub ip: IpAddr,
    pub prefix_len: u8,
    pub link_index: u32,
}

impl Address {
    pub fn family(&self) -> IpFamily {
        IpFamily::of(&self.ip)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextHop {
    pub oif: u32,
    pub gateway: Option<IpAddr>,
    pub hops: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub family: IpFamily,
    pub table: u32,
    /// `None` is the default route.
    pub destination: Option<IpNet>,
    pub gateway: Option<IpAddr>,
    pub oif: Option<u32>,
    pub pref_src: Option<IpAddr>,
    pub priority: Option<u32>,
    pub scope: RouteScope,
    pub protocol: RouteProtocol,
    pub kind: RouteType,
    pub multipath: Vec<NextHop>,
}

impl Route {
    /// A unicast universe-scope route template for `table`.
    pub fn unicast(family: IpFamily, table: u32) -> Self {
        Route {
            family,
            table,
            destination: None,
            gateway: None,
            oif: None,
            pref_src: None,
            priority: None,
            scope: RouteScope::Universe,
            protocol: RouteProtocol::Boot,
            kind: RouteType::Unicast,
            multipath: Vec::new(),
        }
    }

    /// Whether the route egresses through `index`, directly or as one leg of a multipath route.
    pub fn uses_link(&self, index: u32) -> bool {
        self.oif == Some(index) || self.multipath.iter().any(|nh| nh.oif == index)
    }

    pub fn is_default(&self) -> bool {
        self.destination.map_or(true, |d| d.prefix_len() == 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub family: IpFamily,
    pub src: Option<IpNet>,
    pub dst: Option<IpNet>,
    pub table: u32,
    pub priority: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbour {
    pub link_index: u32,
    pub ip: IpAddr,
    pub mac: Option<MacAddr6>,
    pub state: NeighbourState,
}

/// Raw kernel operations. Errors carry the kernel errno untouched; the
/// idempotent accessors in the sibling modules decide what to tolerate.
#[async_trait]
pub trait Netlink: Send + Sync {
    async fn link_by_name(&self, name: &str) -> NetworkResult<Link>;
    async fn link_by_index(&self, index: u32) -> NetworkResult<Link>;
    async fn links(&self) -> NetworkResult<Vec<Link>>;
    async fn link_add_veth(&self, name: &str, peer: &str) -> NetworkResult<()>;
    async fn link_del(&self, index: u32) -> NetworkResult<()>;
    async fn link_up(&self, index: u32) -> NetworkResult<()>;
    async fn link_set_mac(&self, index: u32, mac: MacAddr6) -> NetworkResult<()>;
    async fn link_set_netns(&self, index: u32, netns_fd: RawFd) -> NetworkResult<()>;

    /// Addresses of one link, or of every link when `link_index` is `None`.
    async fn addresses(&self, link_index: Option<u32>) -> NetworkResult<Vec<Address>>;

    /// Routes of every table.
    async fn routes(&self, family: IpFamily) -> NetworkResult<Vec<Route>>;
    async fn route_add(&self, route: &Route) -> NetworkResult<()>;
    async fn route_del(&self, route: &Route) -> NetworkResult<()>;

    async fn rules(&self, family: IpFamily) -> NetworkResult<Vec<Rule>>;
    async fn rule_add(&self, rule: &Rule) -> NetworkResult<()>;
    async fn rule_del(&self, rule: &Rule) -> NetworkResult<()>;

    async fn neighbours(&self) -> NetworkResult<Vec<Neighbour>>;
    async fn neighbour_add(&self, neigh: &Neighbour) -> NetworkResult<()>;
    async fn neighbour_del(&self, neigh: &Neighbour) -> NetworkResult<()>;
}

/// Kernel access over one rtnetlink socket. The socket answers for the
/// namespace it was opened in, which is how `NetNs::netlink` reaches the pod.
pub struct NetlinkHandle {
    rt: rtnetlink::Handle,
    /// Pumps replies for `rt`; aborted on drop so no socket outlives the call.
    reader: tokio::task::JoinHandle<()>,
}

impl NetlinkHandle {
    /// Socket in the namespace the plugin was started in.
    pub fn new() -> NetworkResult<Self> {
        let (reader, rt, _) = rtnetlink::new_connection()?;
        Ok(Self::spawn(reader, rt))
    }

    /// Wrap a connection opened elsewhere, driving it on the current runtime.
    pub(crate) fn spawn<R>(reader: R, rt: rtnetlink::Handle) -> Self
    where
        R: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            rt,
            reader: tokio::spawn(reader),
        }
    }
}

impl Drop for NetlinkHandle {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn first_link<S>(mut links: S, what: String) -> NetworkResult<Link>
where
    S: futures::TryStream<Ok = LinkMessage, Error = rtnetlink::Error> + Unpin,
{
    match links.try_next().await {
        Ok(Some(msg)) => Ok(link_from_message(&msg)),
        Ok(None) => Err(NetworkError::NotFound(what)),
        Err(e) => {
            let err = NetworkError::netlink(format!("get {}", what), e);
            if err.is_not_found() {
                Err(NetworkError::NotFound(what))
            } else {
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Netlink for NetlinkHandle {
    async fn link_by_name(&self, name: &str) -> NetworkResult<Link> {
        let links = self.rt.link().get().match_name(name.to_string()).execute();
        first_link(links, format!("link {}", name)).await
    }

    async fn link_by_index(&self, index: u32) -> NetworkResult<Link> {
        let links = self.rt.link().get().match_index(index).execute();
        first_link(links, format!("link index {}", index)).await
    }

    async fn links(&self) -> NetworkResult<Vec<Link>> {
        let msgs: Vec<LinkMessage> = self
            .rt
            .link()
            .get()
            .execute()
            .try_collect()
            .await
            .map_err(|e| NetworkError::netlink("list links", e))?;
        Ok(msgs.iter().map(link_from_message).collect())
    }

    async fn link_add_veth(&self, name: &str, peer: &str) -> NetworkResult<()> {
        self.rt
            .link()
            .add(LinkVeth::new(name, peer).build())
            .execute()
            .await
            .map_err(|e| NetworkError::netlink(format!("add veth {} peer {}", name, peer), e))
    }

    async fn link_del(&self, index: u32) -> NetworkResult<()> {
        self.rt
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| NetworkError::netlink(format!("delete link {}", index), e))
    }

    async fn link_up(&self, index: u32) -> NetworkResult<()> {
        self.rt
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await
            .map_err(|e| NetworkError::netlink(format!("set link {} up", index), e))
    }

    async fn link_set_mac(&self, index: u32, mac: MacAddr6) -> NetworkResult<()> {
        self.rt
            .link()
            .set(
                LinkUnspec::new_with_index(index)
                    .address(mac.as_bytes().to_vec())
                    .build(),
            )
            .execute()
            .await
            .map_err(|e| NetworkError::netlink(format!("set link {} address {}", index, mac), e))
    }

    async fn link_set_netns(&self, index: u32, netns_fd: RawFd) -> NetworkResult<()> {
        self.rt
            .link()
            .set(
                LinkUnspec::new_with_index(index)
                    .setns_by_fd(netns_fd)
                    .build(),
            )
            .execute()
            .await
            .map_err(|e| NetworkError::netlink(format!("move link {} to netns", index), e))
    }

    async fn addresses(&self, link_index: Option<u32>) -> NetworkResult<Vec<Address>> {
        let mut req = self.rt.address().get();
        if let Some(index) = link_index {
            req = req.set_link_index_filter(index);
        }
        let msgs: Vec<AddressMessage> = req
            .execute()
            .try_collect()
            .await
            .map_err(|e| NetworkError::netlink("list addresses", e))?;
        Ok(msgs
            .iter()
            .filter_map(address_from_message)
            .filter(|a| link_index.map_or(true, |i| a.link_index == i))
            .collect())
    }

    async fn routes(&self, family: IpFamily) -> NetworkResult<Vec<Route>> {
        let mut out = Vec::new();
        for version in family.versions() {
            let mut query = RouteMessage::default();
            query.header.address_family = match version {
                IpVersion::V4 => AddressFamily::Inet,
                IpVersion::V6 => AddressFamily::Inet6,
            };
            let msgs: Vec<RouteMessage> = self
                .rt
                .route()
                .get(query)
                .execute()
                .try_collect()
                .await
                .map_err(|e| NetworkError::netlink("list routes", e))?;
            out.extend(msgs.iter().filter_map(route_from_message));
        }
        Ok(out)
    }

    async fn route_add(&self, route: &Route) -> NetworkResult<()> {
        self.rt
            .route()
            .add(route_message(route))
            .execute()
            .await
            .map_err(|e| NetworkError::netlink(format!("add route {}", describe_route(route)), e))
    }

    async fn route_del(&self, route: &Route) -> NetworkResult<()> {
        self.rt
            .route()
            .del(route_message(route))
            .execute()
            .await
            .map_err(|e| NetworkError::netlink(format!("delete route {}", describe_route(route)), e))
    }

    async fn rules(&self, family: IpFamily) -> NetworkResult<Vec<Rule>> {
        let mut out = Vec::new();
        for version in family.versions() {
            let msgs: Vec<RuleMessage> = self
                .rt
                .rule()
                .get(version.clone())
                .execute()
                .try_collect()
                .await
                .map_err(|e| NetworkError::netlink("list rules", e))?;
            out.extend(msgs.iter().filter_map(rule_from_message));
        }
        Ok(out)
    }

    async fn rule_add(&self, rule: &Rule) -> NetworkResult<()> {
        let op = format!("add rule {}", describe_rule(rule));
        let base = self
            .rt
            .rule()
            .add()
            .table_id(rule.table)
            .action(RuleAction::ToTable);
        let base = match rule.priority {
            Some(p) => base.priority(p),
            None => base,
        };
        let result = match rule.family {
            IpFamily::V6 => {
                let mut req = base.v6();
                if let Some(IpNet::V6(dst)) = rule.dst {
                    req = req.destination_prefix(dst.addr(), dst.prefix_len());
                }
                if let Some(IpNet::V6(src)) = rule.src {
                    req = req.source_prefix(src.addr(), src.prefix_len());
                }
                req.execute().await
            }
            _ => {
                let mut req = base.v4();
                if let Some(IpNet::V4(dst)) = rule.dst {
                    req = req.destination_prefix(dst.addr(), dst.prefix_len());
                }
                if let Some(IpNet::V4(src)) = rule.src {
                    req = req.source_prefix(src.addr(), src.prefix_len());
                }
                req.execute().await
            }
        };
        result.map_err(|e| NetworkError::netlink(op, e))
    }

    async fn rule_del(&self, rule: &Rule) -> NetworkResult<()> {
        self.rt
            .rule()
            .del(rule_message(rule))
            .execute()
            .await
            .map_err(|e| NetworkError::netlink(format!("delete rule {}", describe_rule(rule)), e))
    }

    async fn neighbours(&self) -> NetworkResult<Vec<Neighbour>> {
        let msgs: Vec<NeighbourMessage> = self
            .rt
            .neighbours()
            .get()
            .execute()
            .try_collect()
            .await
            .map_err(|e| NetworkError::netlink("list neighbours", e))?;
        Ok(msgs.iter().filter_map(neighbour_from_message).collect())
    }

    async fn neighbour_add(&self, neigh: &Neighbour) -> NetworkResult<()> {
        let op = format!("add neighbour {} dev {}", neigh.ip, neigh.link_index);
        let mut req = self
            .rt
            .neighbours()
            .add(neigh.link_index, neigh.ip)
            .state(neigh.state);
        if let Some(mac) = neigh.mac {
            req = req.link_local_address(mac.as_bytes());
        }
        req.execute()
            .await
            .map_err(|e| NetworkError::netlink(op, e))
    }

    async fn neighbour_del(&self, neigh: &Neighbour) -> NetworkResult<()> {
        let mut msg = NeighbourMessage::default();
        msg.header.family = IpFamily::of(&neigh.ip).address_family();
        msg.header.ifindex = neigh.link_index;
        msg.attributes
            .push(NeighbourAttribute::Destination(neighbour_address(neigh.ip)));
        self.rt
            .neighbours()
            .del(msg)
            .execute()
            .await
            .map_err(|e| {
                NetworkError::netlink(
                    format!("delete neighbour {} dev {}", neigh.ip, neigh.link_index),
                    e,
                )
            })
    }
}

// ── Message conversion ────────────────────────────────────────────

fn link_from_message(msg: &LinkMessage) -> Link {
    let mut link = Link {
        index: msg.header.index,
        name: String::new(),
        mac: None,
        parent_index: None,
    };
    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => link.name = name.clone(),
            LinkAttribute::Address(bytes) => {
                if let Ok(raw) = <[u8; 6]>::try_from(bytes.as_slice()) {
                    link.mac = Some(MacAddr6::from(raw));
                }
            }
            LinkAttribute::Link(parent) => link.parent_index = Some(*parent),
            _ => {}
        }
    }
    link
}

fn address_from_message(msg: &AddressMessage) -> Option<Address> {
    let family = IpFamily::from_address_family(msg.header.family)?;
    let mut address = None;
    let mut local = None;
    for attr in &msg.attributes {
        match attr {
            AddressAttribute::Address(ip) => address = Some(*ip),
            AddressAttribute::Local(ip) => local = Some(*ip),
            _ => {}
        }
    }
    // IFA_LOCAL is the interface's own address on point-to-point v4 links.
    let ip = match family {
        IpFamily::V4 => local.or(address),
        _ => address.or(local),
    }?;
    Some(Address {
        ip,
        prefix_len: msg.header.prefix_len,
        link_index: msg.header.index,
    })
}

fn route_address(addr: &RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(v4) => Some(IpAddr::V4(*v4)),
        RouteAddress::Inet6(v6) => Some(IpAddr::V6(*v6)),
        _ => None,
    }
}

fn to_route_address(ip: IpAddr) -> RouteAddress {
    match ip {
        IpAddr::V4(v4) => RouteAddress::Inet(v4),
        IpAddr::V6(v6) => RouteAddress::Inet6(v6),
    }
}

fn route_from_message(msg: &RouteMessage) -> Option<Route> {
    let family = IpFamily::from_address_family(msg.header.address_family)?;
    let mut route = Route::unicast(family, u32::from(msg.header.table));
    route.scope = msg.header.scope;
    route.protocol = msg.header.protocol;
    route.kind = msg.header.kind;

    let mut dst = None;
    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Table(t) => route.table = *t,
            RouteAttribute::Destination(a) => dst = route_address(a),
            RouteAttribute::Gateway(a) => route.gateway = route_address(a),
            RouteAttribute::Oif(i) => route.oif = Some(*i),
            RouteAttribute::PrefSource(a) => route.pref_src = route_address(a),
            RouteAttribute::Priority(p) => route.priority = Some(*p),
            RouteAttribute::MultiPath(hops) => {
                route.multipath = hops
                    .iter()
                    .map(|nh| NextHop {
                        oif: nh.interface_index,
                        hops: nh.hops,
                        gateway: nh.attributes.iter().find_map(|a| match a {
                            RouteAttribute::Gateway(g) => route_address(g),
                            _ => None,
                        }),
                    })
                    .collect();
            }
            _ => {}
        }
    }
    route.destination = dst.and_then(|ip| IpNet::new(ip, msg.header.destination_prefix_length).ok());
    Some(route)
}

fn route_message(route: &Route) -> RouteMessage {
    let mut msg = RouteMessage::default();
    msg.header.address_family = route.family.address_family();
    msg.header.table = u8::try_from(route.table).unwrap_or(0);
    msg.header.protocol = route.protocol;
    msg.header.scope = route.scope;
    msg.header.kind = route.kind;
    msg.attributes.push(RouteAttribute::Table(route.table));

    if let Some(dst) = route.destination {
        msg.header.destination_prefix_length = dst.prefix_len();
        if dst.prefix_len() > 0 {
            msg.attributes
                .push(RouteAttribute::Destination(to_route_address(dst.network())));
        }
    }
    if let Some(gw) = route.gateway {
        msg.attributes
            .push(RouteAttribute::Gateway(to_route_address(gw)));
    }
    if let Some(oif) = route.oif {
        msg.attributes.push(RouteAttribute::Oif(oif));
    }
    if let Some(src) = route.pref_src {
        msg.attributes
            .push(RouteAttribute::PrefSource(to_route_address(src)));
    }
    if let Some(p) = route.priority {
        msg.attributes.push(RouteAttribute::Priority(p));
    }
    if !route.multipath.is_empty() {
        let hops = route
            .multipath
            .iter()
            .map(|nh| {
                let mut hop = RouteNextHop::default();
                hop.interface_index = nh.oif;
                hop.hops = nh.hops;
                if let Some(gw) = nh.gateway {
                    hop.attributes
                        .push(RouteAttribute::Gateway(to_route_address(gw)));
                }
                hop
            })
            .collect();
        msg.attributes.push(RouteAttribute::MultiPath(hops));
    }
    msg
}

fn describe_route(route: &Route) -> String {
    let dst = route
        .destination
        .map_or_else(|| "default".to_string(), |d| d.to_string());
    let mut s = format!("{} table {}", dst, route.table);
    if let Some(gw) = route.gateway {
        s.push_str(&format!(" via {}", gw));
    }
    if let Some(oif) = route.oif {
        s.push_str(&format!(" dev {}", oif));
    }
    s
}

fn rule_from_message(msg: &RuleMessage) -> Option<Rule> {
    let family = IpFamily::from_address_family(msg.header.family)?;
    let mut rule = Rule {
        family,
        src: None,
        dst: None,
        table: u32::from(msg.header.table),
        priority: None,
    };
    for attr in &msg.attributes {
        match attr {
            RuleAttribute::Destination(ip) => {
                rule.dst = IpNet::new(*ip, msg.header.dst_len).ok();
            }
            RuleAttribute::Source(ip) => {
                rule.src = IpNet::new(*ip, msg.header.src_len).ok();
            }
            RuleAttribute::Table(t) => rule.table = *t,
            RuleAttribute::Priority(p) => rule.priority = Some(*p),
            _ => {}
        }
    }
    Some(rule)
}

fn rule_message(rule: &Rule) -> RuleMessage {
    let mut msg = RuleMessage::default();
    msg.header.family = rule.family.address_family();
    msg.header.table = u8::try_from(rule.table).unwrap_or(0);
    msg.header.action = RuleAction::ToTable;
    msg.attributes.push(RuleAttribute::Table(rule.table));
    if let Some(dst) = rule.dst {
        msg.header.dst_len = dst.prefix_len();
        msg.attributes.push(RuleAttribute::Destination(dst.network()));
    }
    if let Some(src) = rule.src {
        msg.header.src_len = src.prefix_len();
        msg.attributes.push(RuleAttribute::Source(src.network()));
    }
    if let Some(p) = rule.priority {
        msg.attributes.push(RuleAttribute::Priority(p));
    }
    msg
}

fn describe_rule(rule: &Rule) -> String {
    let from = rule
        .src
        .map_or_else(|| "all".to_string(), |s| s.to_string());
    match rule.dst {
        Some(dst) => format!("from {} to {} lookup {}", from, dst, rule.table),
        None => format!("from {} lookup {}", from, rule.table),
    }
}

fn neighbour_address(ip: IpAddr) -> NeighbourAddress {
    match ip {
        IpAddr::V4(v4) => NeighbourAddress::Inet(v4),
        IpAddr::V6(v6) => NeighbourAddress::Inet6(v6),
    }
}

fn neighbour_from_message(msg: &NeighbourMessage) -> Option<Neighbour> {
    let mut ip = None;
    let mut mac = None;
    for attr in &msg.attributes {
        match attr {
            NeighbourAttribute::Destination(NeighbourAddress::Inet(v4)) => {
                ip = Some(IpAddr::V4(*v4))
            }
            NeighbourAttribute::Destination(NeighbourAddress::Inet6(v6)) => {
                ip = Some(IpAddr::V6(*v6))
            }
            NeighbourAttribute::LinkLocalAddress(bytes) => {
                mac = <[u8; 6]>::try_from(bytes.as_slice())
                    .ok()
                    .map(MacAddr6::from);
            }
            _ => {}
        }
    }
    Some(Neighbour {
        link_index: msg.header.ifindex,
        ip: ip?,
        mac,
        state: msg.header.state,
    })
}
