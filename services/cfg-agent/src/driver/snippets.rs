//! IOS XE configuration fragments pushed by the CSR1kv driver.
//!
//! Each snippet is a short list of CLI commands wrapped in
//! `<cli-config-data>` so it can travel inside an `edit-config`.

use std::fmt;
use std::net::Ipv4Addr;

use hdcfg_networking::Ipv4Prefix;

use super::session::xml_escape;

/// Side of a NAT boundary an interface sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatSide {
    Inside,
    Outside,
}

impl NatSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            NatSide::Inside => "inside",
            NatSide::Outside => "outside",
        }
    }
}

impl fmt::Display for NatSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named group of CLI commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snippet {
    pub name: &'static str,
    pub commands: Vec<String>,
}

impl Snippet {
    fn new(name: &'static str, commands: Vec<String>) -> Self {
        Self { name, commands }
    }

    /// Render as an `edit-config` payload.
    pub fn to_config_xml(&self) -> String {
        let mut xml = String::from("<config><cli-config-data>");
        for cmd in &self.commands {
            xml.push_str("<cmd>");
            xml.push_str(&xml_escape(cmd));
            xml.push_str("</cmd>");
        }
        xml.push_str("</cli-config-data></config>");
        xml
    }
}

pub fn create_vrf(vrf: &str) -> Snippet {
    Snippet::new("CREATE_VRF", vec![format!("ip vrf {}", vrf)])
}

pub fn remove_vrf(vrf: &str) -> Snippet {
    Snippet::new("REMOVE_VRF", vec![format!("no ip vrf {}", vrf)])
}

pub fn enable_interface(interface: &str) -> Snippet {
    Snippet::new(
        "ENABLE_INTF",
        vec![format!("interface {}", interface), "no shutdown".to_string()],
    )
}

pub fn create_subinterface(
    interface: &str,
    vlan: u16,
    vrf: &str,
    address: Ipv4Addr,
    netmask: Ipv4Addr,
) -> Snippet {
    Snippet::new(
        "CREATE_SUBINTERFACE",
        vec![
            format!("interface {}", interface),
            format!("encapsulation dot1Q {}", vlan),
            format!("ip vrf forwarding {}", vrf),
            format!("ip address {} {}", address, netmask),
        ],
    )
}

pub fn remove_subinterface(interface: &str) -> Snippet {
    Snippet::new("REMOVE_SUBINTERFACE", vec![format!("no interface {}", interface)])
}

/// Join the subinterface to HSRP group `group`, answering for `virtual_ip`.
pub fn set_hsrp(
    interface: &str,
    vrf: &str,
    group: u32,
    priority: u32,
    virtual_ip: Ipv4Addr,
) -> Snippet {
    Snippet::new(
        "SET_INTC_HSRP",
        vec![
            format!("interface {}", interface),
            format!("ip vrf forwarding {}", vrf),
            format!("standby {} priority {}", group, priority),
            format!("standby {} ip {}", group, virtual_ip),
        ],
    )
}

pub fn remove_hsrp(interface: &str, group: u32) -> Snippet {
    Snippet::new(
        "REMOVE_INTC_HSRP",
        vec![format!("interface {}", interface), format!("no standby {}", group)],
    )
}

/// Standard ACL permitting one subnet.
pub fn create_acl(acl: &str, subnet: &Ipv4Prefix) -> Snippet {
    Snippet::new(
        "CREATE_ACL",
        vec![
            format!("ip access-list standard {}", acl),
            acl_permit_line(subnet),
        ],
    )
}

/// The permit entry `create_acl` writes, as it shows in the running config.
pub fn acl_permit_line(subnet: &Ipv4Prefix) -> String {
    format!("permit {} {}", subnet.network(), subnet.hostmask())
}

pub fn remove_acl(acl: &str) -> Snippet {
    Snippet::new("REMOVE_ACL", vec![format!("no ip access-list standard {}", acl)])
}

/// Top-level line of the dynamic source NAT rule.
pub fn dynamic_nat_line(acl: &str, outside_interface: &str, vrf: &str) -> String {
    format!(
        "ip nat inside source list {} interface {} vrf {} overload",
        acl, outside_interface, vrf
    )
}

pub fn set_dynamic_nat(acl: &str, outside_interface: &str, vrf: &str) -> Snippet {
    Snippet::new(
        "SET_DYN_SRC_TRL_INTFC",
        vec![dynamic_nat_line(acl, outside_interface, vrf)],
    )
}

pub fn remove_dynamic_nat(acl: &str, outside_interface: &str, vrf: &str) -> Snippet {
    Snippet::new(
        "REMOVE_DYN_SRC_TRL_INTFC",
        vec![format!("no {}", dynamic_nat_line(acl, outside_interface, vrf))],
    )
}

pub fn set_nat(interface: &str, side: NatSide) -> Snippet {
    Snippet::new(
        "SET_NAT",
        vec![format!("interface {}", interface), format!("ip nat {}", side)],
    )
}

pub fn remove_nat(interface: &str, side: NatSide) -> Snippet {
    Snippet::new(
        "REMOVE_NAT",
        vec![
            format!("interface {}", interface),
            format!("no ip nat {}", side),
        ],
    )
}

/// Top-level line of a 1:1 static NAT mapping.
pub fn static_nat_line(fixed: Ipv4Addr, floating: Ipv4Addr, vrf: &str) -> String {
    format!(
        "ip nat inside source static {} {} vrf {} match-in-vrf",
        fixed, floating, vrf
    )
}

pub fn set_static_nat(fixed: Ipv4Addr, floating: Ipv4Addr, vrf: &str) -> Snippet {
    Snippet::new("SET_STATIC_SRC_TRL", vec![static_nat_line(fixed, floating, vrf)])
}

pub fn remove_static_nat(fixed: Ipv4Addr, floating: Ipv4Addr, vrf: &str) -> Snippet {
    Snippet::new(
        "REMOVE_STATIC_SRC_TRL",
        vec![format!("no {}", static_nat_line(fixed, floating, vrf))],
    )
}

/// Top-level line of a static route in a VRF.
/// Start of every static route line for `destination`, whatever its next hop.
pub fn route_prefix(vrf: &str, destination: &Ipv4Prefix) -> String {
    format!(
        "ip route vrf {} {} {} ",
        vrf,
        destination.network(),
        destination.netmask()
    )
}

pub fn route_line(vrf: &str, destination: &Ipv4Prefix, nexthop: Ipv4Addr) -> String {
    format!("{}{}", route_prefix(vrf, destination), nexthop)
}

pub fn set_route(vrf: &str, destination: &Ipv4Prefix, nexthop: Ipv4Addr) -> Snippet {
    Snippet::new("SET_IP_ROUTE", vec![route_line(vrf, destination, nexthop)])
}

pub fn remove_route(vrf: &str, destination: &Ipv4Prefix, nexthop: Ipv4Addr) -> Snippet {
    Snippet::new(
        "REMOVE_IP_ROUTE",
        vec![format!("no {}", route_line(vrf, destination, nexthop))],
    )
}

/// Top-level line of the VRF default route.
pub fn default_route_line(vrf: &str, gateway: Ipv4Addr) -> String {
    format!("ip route vrf {} 0.0.0.0 0.0.0.0 {}", vrf, gateway)
}

pub fn set_default_route(vrf: &str, gateway: Ipv4Addr) -> Snippet {
    Snippet::new("DEFAULT_ROUTE_CFG", vec![default_route_line(vrf, gateway)])
}

pub fn remove_default_route(vrf: &str, gateway: Ipv4Addr) -> Snippet {
    Snippet::new(
        "REMOVE_DEFAULT_ROUTE",
        vec![format!("no {}", default_route_line(vrf, gateway))],
    )
}

/// `<get>` filter that runs `clear ip nat translation *`.
pub const CLEAR_DYNAMIC_NAT_TRANSLATIONS: &str = "<filter type=\"subtree\">\
<config-format-text-cmd><text-filter-spec> | inc ip</text-filter-spec></config-format-text-cmd>\
<oper-data-format-text-block><exec>clear ip nat translation *</exec></oper-data-format-text-block>\
</filter>";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subinterface_snippet() {
        let snippet = create_subinterface(
            "GigabitEthernet2.101",
            101,
            "nrouter-5c7f1d",
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(255, 255, 255, 0),
        );

        assert_eq!(snippet.name, "CREATE_SUBINTERFACE");
        assert_eq!(
            snippet.to_config_xml(),
            "<config><cli-config-data>\
             <cmd>interface GigabitEthernet2.101</cmd>\
             <cmd>encapsulation dot1Q 101</cmd>\
             <cmd>ip vrf forwarding nrouter-5c7f1d</cmd>\
             <cmd>ip address 10.0.0.1 255.255.255.0</cmd>\
             </cli-config-data></config>"
        );
    }

    #[test]
    fn test_acl_uses_wildcard_mask() {
        let subnet = Ipv4Prefix::from_cidr("10.0.0.0/24").unwrap();
        let snippet = create_acl("acl_101", &subnet);

        assert_eq!(
            snippet.commands,
            vec![
                "ip access-list standard acl_101".to_string(),
                "permit 10.0.0.0 0.0.0.255".to_string(),
            ]
        );
    }

    #[test]
    fn test_route_line_uses_netmask() {
        let destination = Ipv4Prefix::from_cidr("10.9.0.0/16").unwrap();
        assert_eq!(
            route_line("nrouter-5c7f1d", &destination, Ipv4Addr::new(10, 0, 0, 254)),
            "ip route vrf nrouter-5c7f1d 10.9.0.0 255.255.0.0 10.0.0.254"
        );
    }

    #[test]
    fn test_remove_snippets_negate_set_lines() {
        let fixed = Ipv4Addr::new(10, 0, 0, 5);
        let floating = Ipv4Addr::new(172, 16, 0, 20);

        assert_eq!(
            remove_static_nat(fixed, floating, "nrouter-1").commands[0],
            format!("no {}", static_nat_line(fixed, floating, "nrouter-1"))
        );
        assert_eq!(
            remove_nat("GigabitEthernet3.100", NatSide::Outside).commands[1],
            "no ip nat outside"
        );
    }
}
