//! Core domain types for qmanager

use crate::store::Row;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Identity
// ============================================================================

/// Console role, ordered by privilege
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Operator,
    Admin,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Admin, Role::Operator, Role::Viewer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Operator => "operator",
            Role::Admin => "admin",
        }
    }

    pub fn priority(&self) -> u8 {
        match self {
            Role::Viewer => 10,
            Role::Operator => 20,
            Role::Admin => 30,
        }
    }

    /// Priority of a stored role name; anything unrecognised is 0.
    pub fn priority_of(name: &str) -> u8 {
        name.parse::<Role>().map(|r| r.priority()).unwrap_or(0)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "viewer" => Ok(Role::Viewer),
            "operator" => Ok(Role::Operator),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// The authenticated user bound to a browser session.
///
/// `role` keeps the raw stored text so that an unknown value stays unknown
/// and fails every role check instead of being coerced to a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub id: i64,
    pub username: String,
    pub role: String,
    pub login_at: DateTime<Utc>,
}

impl Principal {
    pub fn role(&self) -> Option<Role> {
        self.role.parse().ok()
    }
}

// ============================================================================
// Hardware
// ============================================================================

/// QEMU system emulation targets (`qemu-system-<arch>`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    Aarch64,
    Alpha,
    Arm,
    Avr,
    Hppa,
    I386,
    Loongarch64,
    M68k,
    Microblaze,
    Microblazeel,
    Mips,
    Mips64,
    Mips64el,
    Mipsel,
    Or1k,
    Ppc,
    Ppc64,
    Riscv32,
    Riscv64,
    Rx,
    S390x,
    Sh4,
    Sh4eb,
    Sparc,
    Sparc64,
    Tricore,
    X86_64,
    Xtensa,
    Xtensaeb,
}

impl Architecture {
    pub const ALL: [Architecture; 29] = [
        Architecture::Aarch64,
        Architecture::Alpha,
        Architecture::Arm,
        Architecture::Avr,
        Architecture::Hppa,
        Architecture::I386,
        Architecture::Loongarch64,
        Architecture::M68k,
        Architecture::Microblaze,
        Architecture::Microblazeel,
        Architecture::Mips,
        Architecture::Mips64,
        Architecture::Mips64el,
        Architecture::Mipsel,
        Architecture::Or1k,
        Architecture::Ppc,
        Architecture::Ppc64,
        Architecture::Riscv32,
        Architecture::Riscv64,
        Architecture::Rx,
        Architecture::S390x,
        Architecture::Sh4,
        Architecture::Sh4eb,
        Architecture::Sparc,
        Architecture::Sparc64,
        Architecture::Tricore,
        Architecture::X86_64,
        Architecture::Xtensa,
        Architecture::Xtensaeb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Aarch64 => "aarch64",
            Architecture::Alpha => "alpha",
            Architecture::Arm => "arm",
            Architecture::Avr => "avr",
            Architecture::Hppa => "hppa",
            Architecture::I386 => "i386",
            Architecture::Loongarch64 => "loongarch64",
            Architecture::M68k => "m68k",
            Architecture::Microblaze => "microblaze",
            Architecture::Microblazeel => "microblazeel",
            Architecture::Mips => "mips",
            Architecture::Mips64 => "mips64",
            Architecture::Mips64el => "mips64el",
            Architecture::Mipsel => "mipsel",
            Architecture::Or1k => "or1k",
            Architecture::Ppc => "ppc",
            Architecture::Ppc64 => "ppc64",
            Architecture::Riscv32 => "riscv32",
            Architecture::Riscv64 => "riscv64",
            Architecture::Rx => "rx",
            Architecture::S390x => "s390x",
            Architecture::Sh4 => "sh4",
            Architecture::Sh4eb => "sh4eb",
            Architecture::Sparc => "sparc",
            Architecture::Sparc64 => "sparc64",
            Architecture::Tricore => "tricore",
            Architecture::X86_64 => "x86_64",
            Architecture::Xtensa => "xtensa",
            Architecture::Xtensaeb => "xtensaeb",
        }
    }

    /// Emulator binary for this target
    pub fn system_binary(&self) -> String {
        format!("qemu-system-{}", self.as_str())
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Architecture::ALL
            .iter()
            .find(|a| a.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unsupported architecture: {}", s))
    }
}

/// Emulated NIC models offered on the interface form
pub const NETWORK_ADAPTERS: &[&str] = &[
    "e1000",
    "e1000-82544gc",
    "e1000-82545em",
    "e1000e",
    "i82550",
    "i82551",
    "i82557a",
    "i82557b",
    "i82557c",
    "i82558a",
    "i82558b",
    "i82559a",
    "i82559b",
    "i82559c",
    "i82559er",
    "i82562",
    "i82801",
    "igb",
    "ne2k_pci",
    "ne2k_isa",
    "pcnet",
    "rocker",
    "rtl8139",
    "tulip",
    "usb-net",
    "virtio-net-device",
    "virtio-net-pci",
    "virtio-net-pci-non-transitional",
    "virtio-net-pci-transitional",
    "vmxnet3",
];

pub const DEFAULT_NETWORK_ADAPTER: &str = "virtio-net-pci";

/// Disk image formats accepted by the create form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Qcow2,
    Raw,
    Vmdk,
    Vdi,
    Vhdx,
}

impl ImageFormat {
    pub const ALL: [ImageFormat; 5] = [
        ImageFormat::Qcow2,
        ImageFormat::Raw,
        ImageFormat::Vmdk,
        ImageFormat::Vdi,
        ImageFormat::Vhdx,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Raw => "raw",
            ImageFormat::Vmdk => "vmdk",
            ImageFormat::Vdi => "vdi",
            ImageFormat::Vhdx => "vhdx",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageFormat::ALL
            .iter()
            .find(|f| f.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unsupported image format: {}", s))
    }
}

// ============================================================================
// Resource records
// ============================================================================

pub const TABLE_VM: &str = "virtual_machine";
pub const TABLE_INTERFACE: &str = "network_interface";
pub const TABLE_FORWARD: &str = "port_forwarding";
pub const TABLE_USERS: &str = "users";
pub const TABLE_SESSIONS: &str = "auth_sessions";
pub const TABLE_SETTINGS: &str = "settings";

/// A configured virtual machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub name: String,
    pub platform: String,
    pub hda: Option<String>,
    pub cdrom: Option<String>,
    pub memory: i64,
    pub cpu: i64,
    pub boot: String,
}

impl VirtualMachine {
    pub fn from_row(row: &Row) -> Self {
        Self {
            name: row.text("name"),
            platform: row.text("platform"),
            hda: row.opt_text("hda"),
            cdrom: row.opt_text("cdrom"),
            memory: row.int("memory").unwrap_or_default(),
            cpu: row.int("cpu").unwrap_or_default(),
            boot: row.opt_text("boot").unwrap_or_else(|| "c".to_string()),
        }
    }
}

/// Network settings attached to a machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub machine_name: String,
    pub mac: String,
    pub model: String,
    pub ip: Option<String>,
    pub netmask: Option<String>,
    pub gateway: Option<String>,
    pub dns: Option<String>,
}

impl NetworkInterface {
    pub fn from_row(row: &Row) -> Self {
        Self {
            machine_name: row.text("machine_name"),
            mac: row.text("mac"),
            model: row
                .opt_text("model")
                .unwrap_or_else(|| DEFAULT_NETWORK_ADAPTER.to_string()),
            ip: row.opt_text("ip"),
            netmask: row.opt_text("netmask"),
            gateway: row.opt_text("gateway"),
            dns: row.opt_text("dns"),
        }
    }
}

/// Host → guest port forwarding rule for user-mode networking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortForward {
    pub machine_name: String,
    pub protocol: String,
    pub host_port: i64,
    pub guest_port: i64,
    pub guest_ip: Option<String>,
}

impl PortForward {
    pub fn from_row(row: &Row) -> Self {
        Self {
            machine_name: row.text("machine_name"),
            protocol: row.text("protocol"),
            host_port: row.int("host_port").unwrap_or_default(),
            guest_port: row.int("guest_port").unwrap_or_default(),
            guest_ip: row.opt_text("guest_ip"),
        }
    }

    /// `hostfwd=` fragment for `-netdev user`
    pub fn hostfwd(&self) -> String {
        format!(
            "hostfwd={}::{}-{}:{}",
            self.protocol,
            self.host_port,
            self.guest_ip.as_deref().unwrap_or(""),
            self.guest_port
        )
    }
}

/// Random MAC address in the QEMU OUI (52:54:00)
pub fn random_mac() -> String {
    let tail: [u8; 3] = rand::random();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", tail[0], tail[1], tail[2])
}

/// Human readable byte size, e.g. `1.5 MB`
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    let rounded = (size * 100.0).round() / 100.0;
    format!("{} {}", rounded, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trip_and_priority() {
        assert_eq!("operator".parse::<Role>().unwrap(), Role::Operator);
        assert!(Role::Admin.priority() > Role::Operator.priority());
        assert_eq!(Role::priority_of("root"), 0);
        assert_eq!(Role::priority_of("viewer"), 10);
    }

    #[test]
    fn architecture_binary() {
        let arch: Architecture = "x86_64".parse().unwrap();
        assert_eq!(arch.system_binary(), "qemu-system-x86_64");
        assert!("x86_64; rm -rf /".parse::<Architecture>().is_err());
    }

    #[test]
    fn mac_has_qemu_prefix() {
        let mac = random_mac();
        assert!(mac.starts_with("52:54:00:"));
        assert_eq!(mac.len(), 17);
    }

    #[test]
    fn hostfwd_fragment() {
        let fwd = PortForward {
            machine_name: "vm1".into(),
            protocol: "tcp".into(),
            host_port: 2222,
            guest_port: 22,
            guest_ip: None,
        };
        assert_eq!(fwd.hostfwd(), "hostfwd=tcp::2222-:22");
    }

    #[test]
    fn sizes() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(1024 * 1024 * 1024 * 3), "3 GB");
    }
}
