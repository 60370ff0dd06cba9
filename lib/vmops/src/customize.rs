// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest OS customization applied while cloning.

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

/// Longest host name accepted by the guest network tooling.
const MAX_HOSTNAME_LEN: usize = 63;

/// Longest NetBIOS computer name.
const MAX_COMPUTER_NAME_LEN: usize = 15;

const FALLBACK_HOSTNAME: &str = "localhost";
const DEFAULT_DOMAIN: &str = "localhost.domain";

/// The operating system family of a guest, which decides the customization
/// identity it receives.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    strum::EnumString,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum GuestFamily {
    Linux,
    Windows,
}

impl GuestFamily {
    /// Derives the family from a vSphere guest id such as `windows9Server64Guest`
    /// or `rhel7_64Guest`.
    pub fn from_guest_id(guest_id: &str) -> Self {
        if guest_id.to_ascii_lowercase().starts_with("win") {
            Self::Windows
        } else {
            Self::Linux
        }
    }
}

/// Addressing for one guest NIC, in adapter order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum NicIpSettings {
    #[default]
    Dhcp,
    Fixed {
        ip: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
    },
}

/// Settings that only apply to Windows guests.
#[derive(Clone, PartialEq, Eq)]
pub struct WindowsOptions {
    /// Administrator password; blank when unset.
    pub admin_password: Option<String>,
    /// Microsoft time zone index.
    pub time_zone: u32,
    pub workgroup: String,
    pub auto_logon_count: u32,
}

impl Default for WindowsOptions {
    fn default() -> Self {
        Self {
            admin_password: None,
            // GMT Standard Time
            time_zone: 85,
            workgroup: "WORKGROUP".to_owned(),
            auto_logon_count: 1,
        }
    }
}

impl std::fmt::Debug for WindowsOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowsOptions")
            .field("admin_password", &self.admin_password.as_ref().map(|_| "..."))
            .field("time_zone", &self.time_zone)
            .field("workgroup", &self.workgroup)
            .field("auto_logon_count", &self.auto_logon_count)
            .finish()
    }
}

/// What a caller wants the guest to look like after cloning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CustomizationRequest {
    pub family: GuestFamily,
    /// Name of the new VM, used as the host name when none is given.
    pub vm_name: String,
    pub hostname: Option<String>,
    pub domain: Option<String>,
    pub nics: Vec<NicIpSettings>,
    pub dns_servers: Vec<IpAddr>,
    /// tz database name for Linux guests.
    pub linux_time_zone: String,
    pub windows: WindowsOptions,
}

impl CustomizationRequest {
    pub fn new(family: GuestFamily, vm_name: impl Into<String>) -> Self {
        Self {
            family,
            vm_name: vm_name.into(),
            hostname: None,
            domain: None,
            nics: Vec::new(),
            dns_servers: Vec::new(),
            linux_time_zone: "UTC".to_owned(),
            windows: WindowsOptions::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FixedName {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinuxPrep {
    pub host_name: FixedName,
    pub domain: String,
    pub time_zone: String,
}

#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Password {
    pub value: String,
    pub plain_text: bool,
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Password").field("plain_text", &self.plain_text).finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuiUnattended {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<Password>,
    pub time_zone: u32,
    pub auto_logon: bool,
    pub auto_logon_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserData {
    pub full_name: String,
    pub org_name: String,
    pub computer_name: FixedName,
    pub product_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identification {
    pub join_workgroup: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sysprep {
    pub gui_unattended: GuiUnattended,
    pub user_data: UserData,
    pub identification: Identification,
}

/// The guest identity. Linux and Windows guests take different, mutually
/// exclusive identities.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum Identity {
    LinuxPrep(LinuxPrep),
    Sysprep(Sysprep),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IpGenerator {
    Dhcp,
    Fixed {
        #[serde(rename = "ipAddress")]
        ip_address: Ipv4Addr,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpSettings {
    pub ip: IpGenerator,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet_mask: Option<Ipv4Addr>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub gateway: Vec<Ipv4Addr>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AdapterMapping {
    pub adapter: IpSettings,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalIpSettings {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dns_server_list: Vec<IpAddr>,
}

/// A complete guest customization descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Customization {
    pub identity: Identity,
    pub nic_setting_map: Vec<AdapterMapping>,
    #[serde(rename = "globalIPSettings")]
    pub global_ip_settings: GlobalIpSettings,
}

fn is_valid_hostname(name: &str) -> bool {
    let bytes = name.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };

    bytes.len() >= 2
        && first.is_ascii_alphabetic()
        && last.is_ascii_alphanumeric()
        && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
}

fn truncate_name(name: &str, max: usize) -> String {
    // Names are ASCII once validated, so byte and char offsets agree.
    name[..name.len().min(max)].trim_end_matches('-').to_owned()
}

/// Picks the host name a guest is given: `hostname` if set, otherwise the VM
/// name, replaced by `localhost` if it is not a valid host name.
pub fn guest_hostname(vm_name: &str, hostname: Option<&str>) -> String {
    let name = hostname.filter(|h| !h.is_empty()).unwrap_or(vm_name);
    if !is_valid_hostname(name) {
        return FALLBACK_HOSTNAME.to_owned();
    }

    truncate_name(name, MAX_HOSTNAME_LEN)
}

/// Builds the customization descriptor for `req`.
pub fn build_customization(req: &CustomizationRequest) -> Customization {
    let hostname = guest_hostname(&req.vm_name, req.hostname.as_deref());
    let domain = req.domain.clone().unwrap_or_else(|| DEFAULT_DOMAIN.to_owned());

    let identity = match req.family {
        GuestFamily::Linux => Identity::LinuxPrep(LinuxPrep {
            host_name: FixedName { name: hostname },
            domain,
            time_zone: req.linux_time_zone.clone(),
        }),
        GuestFamily::Windows => {
            let computer_name = truncate_name(&hostname, MAX_COMPUTER_NAME_LEN);
            Identity::Sysprep(Sysprep {
                gui_unattended: GuiUnattended {
                    password: req.windows.admin_password.as_ref().map(|p| {
                        Password { value: p.clone(), plain_text: true }
                    }),
                    time_zone: req.windows.time_zone,
                    auto_logon: true,
                    auto_logon_count: req.windows.auto_logon_count,
                },
                user_data: UserData {
                    full_name: hostname.clone(),
                    org_name: hostname,
                    computer_name: FixedName { name: computer_name },
                    product_id: String::new(),
                },
                identification: Identification {
                    join_workgroup: req.windows.workgroup.clone(),
                },
            })
        }
    };

    let nic_setting_map = req
        .nics
        .iter()
        .map(|nic| AdapterMapping {
            adapter: match nic {
                NicIpSettings::Dhcp => IpSettings {
                    ip: IpGenerator::Dhcp,
                    subnet_mask: None,
                    gateway: Vec::new(),
                },
                NicIpSettings::Fixed { ip, netmask, gateway } => IpSettings {
                    ip: IpGenerator::Fixed { ip_address: *ip },
                    subnet_mask: Some(*netmask),
                    gateway: gateway.iter().copied().collect(),
                },
            },
        })
        .collect();

    Customization {
        identity,
        nic_setting_map,
        global_ip_settings: GlobalIpSettings {
            dns_server_list: req.dns_servers.clone(),
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn hostnames() {
        const TEST_CASES: &[(&str, Option<&str>, &str)] = &[
            ("web-01", None, "web-01"),
            ("web-01", Some(""), "web-01"),
            ("vm", Some("db1"), "db1"),
            ("1st-vm", None, "localhost"),
            ("vm", Some("-db"), "localhost"),
            ("vm", Some("db-"), "localhost"),
            ("vm", Some("db_1"), "localhost"),
            ("vm", Some("d"), "localhost"),
            ("my vm", None, "localhost"),
        ];

        for (vm_name, hostname, expected) in TEST_CASES {
            assert_eq!(
                guest_hostname(vm_name, *hostname),
                *expected,
                "hostname for vm {vm_name:?} / {hostname:?}"
            );
        }
    }

    #[test]
    fn long_hostnames_are_truncated() {
        let long = format!("a{}", "b".repeat(99));
        assert_eq!(guest_hostname(&long, None).len(), MAX_HOSTNAME_LEN);

        // A cut that lands on a hyphen drops it.
        let hyphenated = format!("{}-{}", "a".repeat(62), "b".repeat(10));
        assert_eq!(guest_hostname(&hyphenated, None), "a".repeat(62));
    }

    #[test]
    fn guest_family_from_guest_id() {
        assert_eq!(
            GuestFamily::from_guest_id("windows2019srv_64Guest"),
            GuestFamily::Windows
        );
        assert_eq!(GuestFamily::from_guest_id("winNetEnterpriseGuest"), GuestFamily::Windows);
        assert_eq!(GuestFamily::from_guest_id("rhel7_64Guest"), GuestFamily::Linux);
        assert_eq!("Windows".parse::<GuestFamily>().unwrap(), GuestFamily::Windows);
    }

    #[test]
    fn linux_identity() {
        let mut req = CustomizationRequest::new(GuestFamily::Linux, "web-01");
        req.domain = Some("example.com".to_owned());
        req.nics = vec![
            NicIpSettings::Fixed {
                ip: Ipv4Addr::new(10, 0, 0, 13),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: Some(Ipv4Addr::new(10, 0, 0, 1)),
            },
            NicIpSettings::Dhcp,
        ];
        req.dns_servers = vec!["10.1.10.14".parse().unwrap()];

        let custom = build_customization(&req);
        let Identity::LinuxPrep(prep) = &custom.identity else {
            panic!("expected a Linux identity, got {:?}", custom.identity);
        };
        assert_eq!(prep.host_name.name, "web-01");
        assert_eq!(prep.domain, "example.com");
        assert_eq!(prep.time_zone, "UTC");

        assert_eq!(
            serde_json::to_value(&custom.nic_setting_map).unwrap(),
            json!([
                {"adapter": {
                    "ip": {"type": "fixed", "ipAddress": "10.0.0.13"},
                    "subnetMask": "255.255.255.0",
                    "gateway": ["10.0.0.1"]
                }},
                {"adapter": {"ip": {"type": "dhcp"}}}
            ])
        );

        let value = serde_json::to_value(&custom).unwrap();
        assert_eq!(value["globalIPSettings"]["dnsServerList"], json!(["10.1.10.14"]));
        assert_eq!(value["identity"]["type"], "LinuxPrep");
    }

    #[test]
    fn windows_identity() {
        let mut req = CustomizationRequest::new(
            GuestFamily::Windows,
            "accounting-server-01",
        );
        req.windows.admin_password = Some("hunter2".to_owned());

        let custom = build_customization(&req);
        let Identity::Sysprep(sysprep) = &custom.identity else {
            panic!("expected a sysprep identity, got {:?}", custom.identity);
        };
        assert_eq!(sysprep.user_data.full_name, "accounting-server-01");
        assert_eq!(sysprep.user_data.computer_name.name, "accounting-serv");
        assert_eq!(sysprep.user_data.product_id, "");
        assert_eq!(sysprep.identification.join_workgroup, "WORKGROUP");
        assert_eq!(sysprep.gui_unattended.time_zone, 85);
        assert!(sysprep.gui_unattended.auto_logon);
        assert_eq!(sysprep.gui_unattended.auto_logon_count, 1);
        assert_eq!(
            sysprep.gui_unattended.password.as_ref().unwrap().value,
            "hunter2"
        );

        // Passwords stay out of debug output.
        assert!(!format!("{req:?}").contains("hunter2"));
        assert!(!format!("{custom:?}").contains("hunter2"));

        let value = serde_json::to_value(&custom).unwrap();
        assert_eq!(value["identity"]["type"], "Sysprep");
        assert!(value["identity"].get("hostName").is_none());
    }
}
