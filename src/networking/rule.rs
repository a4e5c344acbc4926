use crate::networking::error::NetworkResult;
use crate::networking::netlink::{IpFamily, Netlink, Rule};
use ipnet::IpNet;

fn family_of(net: &IpNet) -> IpFamily {
    IpFamily::of(&net.addr())
}

async fn add_tolerant<N: Netlink + ?Sized>(nl: &N, rule: Rule) -> NetworkResult<()> {
    match nl.rule_add(&rule).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_exists() => Ok(()),
        Err(e) => Err(e),
    }
}

async fn del_tolerant<N: Netlink + ?Sized>(nl: &N, rule: Rule) -> NetworkResult<()> {
    match nl.rule_del(&rule).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// `ip rule add to <dst> lookup <table>`
pub async fn add_to_rule<N: Netlink + ?Sized>(nl: &N, dst: IpNet, table: u32) -> NetworkResult<()> {
    let rule = Rule {
        family: family_of(&dst),
        src: None,
        dst: Some(dst),
        table,
        priority: None,
    };
    add_tolerant(nl, rule).await
}

/// `ip rule add from <src> lookup <table>`
pub async fn add_from_rule<N: Netlink + ?Sized>(nl: &N, src: IpNet, table: u32) -> NetworkResult<()> {
    let rule = Rule {
        family: family_of(&src),
        src: Some(src),
        dst: None,
        table,
        priority: None,
    };
    add_tolerant(nl, rule).await
}

pub async fn del_to_rule<N: Netlink + ?Sized>(nl: &N, dst: IpNet, table: u32) -> NetworkResult<()> {
    let rule = Rule {
        family: family_of(&dst),
        src: None,
        dst: Some(dst),
        table,
        priority: None,
    };
    del_tolerant(nl, rule).await
}

pub async fn del_from_rule<N: Netlink + ?Sized>(nl: &N, src: IpNet, table: u32) -> NetworkResult<()> {
    let rule = Rule {
        family: family_of(&src),
        src: Some(src),
        dst: None,
        table,
        priority: None,
    };
    del_tolerant(nl, rule).await
}

/// Make sure `from all lookup <table>` exists at `priority` for each family in
/// `family`. It can go missing when a node operator flushes rules.
pub async fn ensure_from_all_rule<N: Netlink + ?Sized>(
    nl: &N,
    table: u32,
    priority: u32,
    family: IpFamily,
) -> NetworkResult<()> {
    let existing = nl.rules(family).await?;
    for fam in [IpFamily::V4, IpFamily::V6] {
        if !family.includes(fam) {
            continue;
        }
        let present = existing
            .iter()
            .any(|r| r.family == fam && r.src.is_none() && r.dst.is_none() && r.table == table);
        if present {
            continue;
        }
        tracing::info!(table, priority, family = ?fam, "restoring from-all rule");
        add_tolerant(
            nl,
            Rule {
                family: fam,
                src: None,
                dst: None,
                table,
                priority: Some(priority),
            },
        )
        .await?;
    }
    Ok(())
}
