//! Per-machine network interfaces and user-mode port forwarding

use super::{machine_names, options, target_machine, ERR_NAME_NOT_SPECIFIED, ERR_VM_NOT_FOUND};
use crate::dispatch::{ResourceModule, VerbFn};
use crate::render;
use crate::request::Request;
use qmanager_common::{
    random_mac, Error, Filter, NetworkInterface, PortForward, Result, Store, Validator, Value,
    DEFAULT_NETWORK_ADAPTER, NETWORK_ADAPTERS, TABLE_FORWARD, TABLE_INTERFACE, TABLE_VM,
};
use tracing::info;

const ROUTE: &str = "network/manage";
const PROTOCOLS: &[&str] = &["tcp", "udp"];
const DEFAULT_NETMASK: &str = "255.255.255.0";
const ERR_MAC_TAKEN: &str = "MAC address already exists";
const ERR_HAS_INTERFACE: &str = "Network interface already exists for this machine";

pub struct NetworkModule;

const VERBS: &[(&str, VerbFn<NetworkModule>)] = &[
    ("list", list),
    ("create", create),
    ("edit", edit),
    ("delete", delete),
    ("portforward", portforward),
    ("delete_forward", delete_forward),
];

const MENU: &[(&str, &str)] = &[
    ("list", "Network Interfaces"),
    ("create", "Add Interface"),
    ("portforward", "Port Forwarding"),
];

impl ResourceModule for NetworkModule {
    const ROUTE: &'static str = ROUTE;
    const LABEL: &'static str = "Network Settings";

    fn verbs(&self) -> &'static [(&'static str, VerbFn<Self>)] {
        VERBS
    }

    fn menu(&self) -> &'static [(&'static str, &'static str)] {
        MENU
    }

    fn state(&self, request: &Request<'_>) -> String {
        let store = request.ctx.store();
        match (
            store.count(TABLE_INTERFACE, &Filter::all()),
            store.count(TABLE_FORWARD, &Filter::all()),
        ) {
            (Ok(interfaces), Ok(forwards)) => format!(
                "Network interfaces: {}, Port forwarding rules: {}",
                interfaces, forwards
            ),
            _ => "Error getting network state".to_string(),
        }
    }
}

/// QEMU networking arguments for `machine`:
/// `-netdev user,id=net0[,hostfwd=...] -device <model>,netdev=net0[,mac=...]`
pub fn network_args(store: &dyn Store, machine: &str) -> Result<Vec<String>> {
    let by_machine = Filter::new().eq("machine_name", machine);
    let iface = store
        .find(TABLE_INTERFACE, &by_machine)?
        .map(|row| NetworkInterface::from_row(&row));

    let mut netdev = "user,id=net0".to_string();
    for row in store.select(TABLE_FORWARD, &["*"], &by_machine, None)? {
        netdev.push(',');
        netdev.push_str(&PortForward::from_row(&row).hostfwd());
    }

    let device = match iface {
        Some(iface) => format!("{},netdev=net0,mac={}", iface.model, iface.mac),
        None => format!("{},netdev=net0", DEFAULT_NETWORK_ADAPTER),
    };

    Ok(vec!["-netdev".into(), netdev, "-device".into(), device])
}

fn list(_: &NetworkModule, request: &Request<'_>, _: &[String]) -> Result<String> {
    let rows = request
        .ctx
        .store()
        .select(TABLE_INTERFACE, &["*"], &Filter::all(), None)?;
    if rows.is_empty() {
        return Ok(format!(
            "<p>No network interfaces configured.</p>{}",
            render::link_button(&request.link(&format!("{}/create", ROUTE)), "Add Interface")
        ));
    }

    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            let iface = NetworkInterface::from_row(row);
            let edit = request.link(&format!("{}/edit/{}", ROUTE, iface.machine_name));
            let del = request.link(&format!("{}/delete/{}", ROUTE, iface.machine_name));
            vec![
                render::escape(&iface.machine_name),
                render::escape(&iface.mac),
                render::escape(&iface.model),
                render::escape(iface.ip.as_deref().unwrap_or("DHCP")),
                render::escape(iface.netmask.as_deref().unwrap_or("")),
                render::escape(iface.gateway.as_deref().unwrap_or("")),
                render::escape(iface.dns.as_deref().unwrap_or("")),
                format!(
                    "{} {}",
                    render::link_button(&edit, "Edit"),
                    render::link_button(&del, "Delete")
                ),
            ]
        })
        .collect();

    Ok(render::table(
        &["VM Name", "MAC", "Model", "IP", "Netmask", "Gateway", "DNS", "Actions"],
        &cells,
    ))
}

fn interface_form(
    request: &Request<'_>,
    title: &str,
    action: &str,
    submit: &str,
    current: &NetworkInterface,
) -> Result<String> {
    let machines = machine_names(request)?;
    let fields = [
        render::select(
            "Virtual machine",
            "machine_name",
            &options(machines.as_slice()),
            &current.machine_name,
        ),
        render::select(
            "Adapter model",
            "model",
            &options(NETWORK_ADAPTERS),
            &current.model,
        ),
        render::input("MAC address", "mac_address", "text", &current.mac),
        render::input("IP address", "ip_address", "text", current.ip.as_deref().unwrap_or("")),
        render::input(
            "Netmask",
            "netmask",
            "text",
            current.netmask.as_deref().unwrap_or(DEFAULT_NETMASK),
        ),
        render::input("Gateway", "gateway", "text", current.gateway.as_deref().unwrap_or("")),
        render::input("DNS", "dns", "text", current.dns.as_deref().unwrap_or("")),
    ]
    .concat();
    Ok(format!(
        "<h3>{}</h3>{}",
        render::escape(title),
        render::form(&request.link(action), &fields, submit)
    ))
}

fn opt(request: &Request<'_>, field: &str) -> Value {
    let v = request.field(field).trim();
    if v.is_empty() {
        Value::Null
    } else {
        Value::from(v)
    }
}

/// A write rejected by a UNIQUE column gets the message of the matching
/// form rule
fn interface_conflict(e: Error) -> Error {
    if !e.is_constraint() {
        return e;
    }
    if e.to_string().contains("network_interface.machine_name") {
        Error::invalid(format!("machine_name: {}", ERR_HAS_INTERFACE))
    } else {
        Error::invalid(format!("mac_address: {}", ERR_MAC_TAKEN))
    }
}

/// Validate and persist the interface form; `edit` names the machine whose
/// interface is replaced
fn save_interface(request: &Request<'_>, edit: Option<&str>) -> Result<String> {
    let store = request.ctx.store();
    let exclude: Vec<(&str, &str)> = edit.map(|m| ("machine_name", m)).into_iter().collect();

    let mut v = Validator::new(request.form.clone());
    v.required_msg("machine_name", "Please select a virtual machine")
        .machine_name("machine_name")
        .exists(store, "machine_name", TABLE_VM, "name", Some(ERR_VM_NOT_FOUND))
        .unique(
            store,
            "machine_name",
            TABLE_INTERFACE,
            "machine_name",
            Some(ERR_HAS_INTERFACE),
            &exclude,
        )
        .required("mac_address")
        .mac("mac_address")
        .unique(
            store,
            "mac_address",
            TABLE_INTERFACE,
            "mac",
            Some(ERR_MAC_TAKEN),
            &exclude,
        )
        .one_of("model", NETWORK_ADAPTERS)
        .ip("ip_address")
        .ip("netmask")
        .ip("gateway")
        .ip("dns");
    v.finish()?;

    let machine = request.field("machine_name").to_string();
    let model = match request.field("model") {
        "" => DEFAULT_NETWORK_ADAPTER,
        m => m,
    };
    let values = vec![
        ("machine_name", Value::from(&machine)),
        ("mac", Value::from(request.field("mac_address"))),
        ("model", Value::from(model)),
        ("ip", opt(request, "ip_address")),
        ("netmask", opt(request, "netmask")),
        ("gateway", opt(request, "gateway")),
        ("dns", opt(request, "dns")),
    ];

    let action = match edit {
        Some(current) => {
            store
                .update(
                    TABLE_INTERFACE,
                    &values,
                    &Filter::new().eq("machine_name", current),
                )
                .map_err(interface_conflict)?;
            "updated"
        }
        None => {
            store
                .insert(TABLE_INTERFACE, &values)
                .map_err(interface_conflict)?;
            "created"
        }
    };
    info!(machine = %machine, action, "Network interface saved");

    Ok(render::success_block(
        "Success!",
        &format!(
            "<p>Network interface for '{}' {} successfully.</p><p>{}</p>",
            render::escape(&machine),
            action,
            render::link_button(&request.link(&format!("{}/list", ROUTE)), "View all interfaces")
        ),
    ))
}

fn create(_: &NetworkModule, request: &Request<'_>, _: &[String]) -> Result<String> {
    if request.is_post() {
        return save_interface(request, None);
    }
    let blank = NetworkInterface {
        machine_name: String::new(),
        mac: random_mac(),
        model: DEFAULT_NETWORK_ADAPTER.to_string(),
        ip: None,
        netmask: None,
        gateway: None,
        dns: None,
    };
    interface_form(
        request,
        "Add Network Interface",
        &format!("{}/create", ROUTE),
        "Create Interface",
        &blank,
    )
}

fn edit(_: &NetworkModule, request: &Request<'_>, args: &[String]) -> Result<String> {
    let machine = target_machine(request, args)?;
    let current = request
        .ctx
        .store()
        .find(TABLE_INTERFACE, &Filter::new().eq("machine_name", machine.as_str()))?
        .map(|row| NetworkInterface::from_row(&row))
        .ok_or_else(|| Error::not_found("Network interface for machine", machine.as_str()))?;

    if request.is_post() {
        return save_interface(request, Some(&machine));
    }
    interface_form(
        request,
        "Edit Network Interface",
        &format!("{}/edit/{}", ROUTE, machine),
        "Update Interface",
        &current,
    )
}

/// Name argument that only has to be well formed; rows of a machine that no
/// longer exists can still be removed
fn machine_arg(args: &[String]) -> Result<String> {
    let name = args.first().cloned().unwrap_or_default();
    let mut v = Validator::from_pairs([("machine_name", name.as_str())]);
    v.required_msg("machine_name", ERR_NAME_NOT_SPECIFIED)
        .machine_name("machine_name");
    v.finish()?;
    Ok(name)
}

fn delete(_: &NetworkModule, request: &Request<'_>, args: &[String]) -> Result<String> {
    let machine = machine_arg(args)?;
    let removed = request.ctx.store().delete(
        TABLE_INTERFACE,
        &Filter::new().eq("machine_name", machine.as_str()),
    )?;
    info!(machine = %machine, removed, "Deleted network interface");
    Ok(render::success_block(
        "Interface deleted",
        &format!(
            "<p>Network interface for '{}' deleted successfully.</p><p>{}</p>",
            render::escape(&machine),
            render::link_button(&request.link(&format!("{}/list", ROUTE)), "Back to list")
        ),
    ))
}

fn portforward(_: &NetworkModule, request: &Request<'_>, _: &[String]) -> Result<String> {
    if request.is_post() {
        return add_forward(request);
    }

    let rows = request
        .ctx
        .store()
        .select(TABLE_FORWARD, &["*"], &Filter::all(), None)?;
    let mut html = "<h3>Port Forwarding Rules</h3>".to_string();
    if !rows.is_empty() {
        let cells: Vec<Vec<String>> = rows
            .iter()
            .map(|row| {
                let fwd = PortForward::from_row(row);
                let del = request.link(&format!(
                    "{}/delete_forward/{}/{}/{}",
                    ROUTE, fwd.machine_name, fwd.protocol, fwd.host_port
                ));
                vec![
                    render::escape(&fwd.machine_name),
                    render::escape(&fwd.protocol),
                    fwd.host_port.to_string(),
                    fwd.guest_port.to_string(),
                    render::escape(fwd.guest_ip.as_deref().unwrap_or("Default")),
                    render::link_button(&del, "Delete"),
                ]
            })
            .collect();
        html.push_str(&render::table(
            &["VM Name", "Protocol", "Host Port", "Guest Port", "Guest IP", "Actions"],
            &cells,
        ));
    }

    let machines = machine_names(request)?;
    let fields = [
        render::select("Virtual machine", "machine_name", &options(machines.as_slice()), ""),
        render::select("Protocol", "protocol", &options(PROTOCOLS), "tcp"),
        render::input("Host port", "host_port", "number", ""),
        render::input("Guest port", "guest_port", "number", ""),
        render::input("Guest IP (optional)", "guest_ip", "text", ""),
    ]
    .concat();
    html.push_str("<h4>Add rule</h4>");
    html.push_str(&render::form(
        &request.link(&format!("{}/portforward", ROUTE)),
        &fields,
        "Add Rule",
    ));
    Ok(html)
}

fn add_forward(request: &Request<'_>) -> Result<String> {
    let store = request.ctx.store();
    let mut v = Validator::new(request.form.clone());
    v.required_msg("machine_name", "Please select a virtual machine")
        .machine_name("machine_name")
        .exists(store, "machine_name", TABLE_VM, "name", Some(ERR_VM_NOT_FOUND))
        .required("protocol")
        .one_of("protocol", PROTOCOLS)
        .required("host_port")
        .integer("host_port")
        .range("host_port", 1, 65535)
        .required("guest_port")
        .integer("guest_port")
        .range("guest_port", 1, 65535)
        .ip("guest_ip");
    v.finish()?;

    let machine = request.field("machine_name");
    let protocol = request.field("protocol");
    let host_port: i64 = request.field("host_port").trim().parse().unwrap_or_default();
    let guest_port: i64 = request.field("guest_port").trim().parse().unwrap_or_default();

    let duplicate = Filter::new()
        .eq("machine_name", machine)
        .eq("protocol", protocol)
        .eq("host_port", host_port);
    if store.exists(TABLE_FORWARD, &duplicate)? {
        return Err(Error::invalid("host_port: Port forwarding rule already exists"));
    }

    store
        .insert(
            TABLE_FORWARD,
            &vec![
                ("machine_name", Value::from(machine)),
                ("protocol", Value::from(protocol)),
                ("host_port", Value::from(host_port)),
                ("guest_port", Value::from(guest_port)),
                ("guest_ip", opt(request, "guest_ip")),
            ],
        )
        .map_err(|e| {
            if e.is_constraint() {
                Error::invalid("host_port: Port forwarding rule already exists")
            } else {
                e
            }
        })?;
    info!(
        machine,
        protocol, host_port, guest_port, "Created port forwarding rule"
    );

    Ok(render::success_block(
        "Port forwarding rule created",
        &format!(
            "<p>{} {} &rarr; {}</p><p>{}</p>",
            render::escape(protocol),
            host_port,
            guest_port,
            render::link_button(
                &request.link(&format!("{}/portforward", ROUTE)),
                "Back to port forwarding"
            )
        ),
    ))
}

/// `delete_forward/<machine>` drops every rule of the machine,
/// `delete_forward/<machine>/<proto>/<host_port>` a single one
fn delete_forward(_: &NetworkModule, request: &Request<'_>, args: &[String]) -> Result<String> {
    let machine = machine_arg(args)?;
    let mut filter = Filter::new().eq("machine_name", machine.as_str());
    if let [_, protocol, port, ..] = args {
        let mut v = Validator::from_pairs([("protocol", protocol.as_str()), ("host_port", port.as_str())]);
        v.one_of("protocol", PROTOCOLS)
            .integer("host_port")
            .range("host_port", 1, 65535);
        v.finish()?;
        filter = filter
            .eq("protocol", protocol.as_str())
            .eq("host_port", port.trim().parse::<i64>().unwrap_or_default());
    }

    let removed = request.ctx.store().delete(TABLE_FORWARD, &filter)?;
    info!(machine = %machine, removed, "Deleted port forwarding rules");
    Ok(render::success_block(
        "Port forwarding removed",
        &format!(
            "<p>Removed {} rule(s) for '{}'.</p><p>{}</p>",
            removed,
            render::escape(&machine),
            render::link_button(
                &request.link(&format!("{}/portforward", ROUTE)),
                "Back to port forwarding"
            )
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::manage;
    use crate::testing::{args, form, principal, seed_machine, test_context, test_context_with};
    use qmanager_common::{Database, Pagination, Row, Values};
    use std::sync::Arc;

    #[test]
    fn args_include_forwards_and_mac() {
        let (ctx, _dir, _exec) = test_context();
        seed_machine(&ctx, "vm1", None);
        let store = ctx.store();
        store
            .insert(
                TABLE_FORWARD,
                &vec![
                    ("machine_name", Value::from("vm1")),
                    ("protocol", Value::from("tcp")),
                    ("host_port", Value::from(2222i64)),
                    ("guest_port", Value::from(22i64)),
                ],
            )
            .unwrap();

        let args = network_args(store, "vm1").unwrap();
        assert_eq!(args[0], "-netdev");
        assert_eq!(args[1], "user,id=net0,hostfwd=tcp::2222-:22");
        assert_eq!(args[2], "-device");
        assert!(args[3].starts_with("virtio-net-pci,netdev=net0,mac=52:54:00:"));

        let bare = network_args(store, "nomachine").unwrap();
        assert_eq!(bare[3], "virtio-net-pci,netdev=net0");
    }

    #[test]
    fn interface_create_validates_and_saves() {
        let (ctx, _dir, _exec) = test_context();
        seed_machine(&ctx, "vm1", None);
        ctx.store()
            .delete(TABLE_INTERFACE, &Filter::new().eq("machine_name", "vm1"))
            .unwrap();
        let who = Some(principal("operator"));

        let req = Request::post(
            &ctx,
            who.clone(),
            form(&[("machine_name", "vm1"), ("mac_address", "zz:zz"), ("ip_address", "300.1.1.1")]),
        );
        let html = manage(&NetworkModule, &req, &["create".to_string()]);
        assert!(html.contains("mac_address: Invalid MAC address format"));
        assert!(html.contains("ip_address: Invalid IP address"));

        let req = Request::post(
            &ctx,
            who.clone(),
            form(&[
                ("machine_name", "vm1"),
                ("mac_address", "52:54:00:aa:bb:cc"),
                ("ip_address", "10.0.2.15"),
            ]),
        );
        let html = manage(&NetworkModule, &req, &["create".to_string()]);
        assert!(html.contains("created successfully"));
        assert!(html.contains("Network interfaces: 1, Port forwarding rules: 0"));

        let req = Request::post(
            &ctx,
            who,
            form(&[("machine_name", "vm1"), ("mac_address", "52:54:00:aa:bb:cd")]),
        );
        let html = manage(&NetworkModule, &req, &["create".to_string()]);
        assert!(html.contains("machine_name: Network interface already exists for this machine"));
    }

    /// Store whose interface lookups miss existing rows, as when another
    /// request inserts between the form checks and the write
    struct StaleInterfaceChecks(Database);

    impl Store for StaleInterfaceChecks {
        fn select(
            &self,
            table: &str,
            columns: &[&str],
            filter: &Filter,
            page: Option<Pagination>,
        ) -> Result<Vec<Row>> {
            self.0.select(table, columns, filter, page)
        }

        fn insert(&self, table: &str, values: &Values) -> Result<i64> {
            self.0.insert(table, values)
        }

        fn insert_unless(&self, table: &str, values: &Values, guard: &Filter) -> Result<Option<i64>> {
            self.0.insert_unless(table, values, guard)
        }

        fn update(&self, table: &str, values: &Values, filter: &Filter) -> Result<usize> {
            self.0.update(table, values, filter)
        }

        fn delete(&self, table: &str, filter: &Filter) -> Result<usize> {
            self.0.delete(table, filter)
        }

        fn count(&self, table: &str, filter: &Filter) -> Result<i64> {
            if table == TABLE_INTERFACE {
                return Ok(0);
            }
            self.0.count(table, filter)
        }
    }

    #[test]
    fn late_conflicts_use_form_messages() {
        let (ctx, _dir, _exec) =
            test_context_with(Arc::new(StaleInterfaceChecks(Database::open_memory().unwrap())));
        seed_machine(&ctx, "vm1", None);
        ctx.store()
            .insert(
                TABLE_VM,
                &vec![
                    ("name", Value::from("vm2")),
                    ("platform", Value::from("x86_64")),
                    ("memory", Value::from(256i64)),
                    ("cpu", Value::from(1i64)),
                ],
            )
            .unwrap();
        let taken = NetworkInterface::from_row(
            &ctx.store()
                .find(TABLE_INTERFACE, &Filter::new().eq("machine_name", "vm1"))
                .unwrap()
                .unwrap(),
        )
        .mac;

        let req = Request::post(
            &ctx,
            Some(principal("operator")),
            form(&[("machine_name", "vm2"), ("mac_address", taken.as_str())]),
        );
        let html = manage(&NetworkModule, &req, &["create".to_string()]);
        assert!(html.contains("mac_address: MAC address already exists"), "{}", html);
        assert!(!html.contains("Value already exists"));

        let req = Request::post(
            &ctx,
            Some(principal("operator")),
            form(&[("machine_name", "vm1"), ("mac_address", "52:54:00:aa:bb:cc")]),
        );
        let html = manage(&NetworkModule, &req, &["create".to_string()]);
        assert!(
            html.contains("machine_name: Network interface already exists for this machine"),
            "{}",
            html
        );
        assert_eq!(
            ctx.store()
                .select(TABLE_INTERFACE, &["*"], &Filter::all(), None)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn edit_excludes_own_mac() {
        let (ctx, _dir, _exec) = test_context();
        seed_machine(&ctx, "vm1", None);
        let mac = NetworkInterface::from_row(
            &ctx.store()
                .find(TABLE_INTERFACE, &Filter::new().eq("machine_name", "vm1"))
                .unwrap()
                .unwrap(),
        )
        .mac;

        let req = Request::post(
            &ctx,
            Some(principal("admin")),
            form(&[("machine_name", "vm1"), ("mac_address", mac.as_str()), ("dns", "1.1.1.1")]),
        );
        let html = manage(&NetworkModule, &req, &["edit".to_string(), "vm1".to_string()]);
        assert!(html.contains("updated successfully"), "{}", html);
    }

    #[test]
    fn port_forward_rules() {
        let (ctx, _dir, _exec) = test_context();
        seed_machine(&ctx, "vm1", None);
        let rule = form(&[
            ("machine_name", "vm1"),
            ("protocol", "tcp"),
            ("host_port", "8080"),
            ("guest_port", "80"),
        ]);
        let verb = ["portforward".to_string()];

        let req = Request::post(&ctx, Some(principal("operator")), rule.clone());
        assert!(manage(&NetworkModule, &req, &verb).contains("Port forwarding rule created"));

        let req = Request::post(&ctx, Some(principal("operator")), rule);
        assert!(manage(&NetworkModule, &req, &verb).contains("Port forwarding rule already exists"));

        let bad = form(&[
            ("machine_name", "vm1"),
            ("protocol", "icmp"),
            ("host_port", "70000"),
            ("guest_port", "80"),
        ]);
        let req = Request::post(&ctx, Some(principal("operator")), bad);
        let html = manage(&NetworkModule, &req, &verb);
        assert!(html.contains("protocol: Must be one of: tcp, udp"));
        assert!(html.contains("host_port: Must be between 1 and 65535"));

        let req = Request::get(&ctx, Some(principal("operator")));
        let html = manage(
            &NetworkModule,
            &req,
            &args(&["delete_forward", "vm1", "tcp", "8080"]),
        );
        assert!(html.contains("Removed 1 rule(s)"));
    }
}
