//! Virtual machine records and their emulator processes

use super::image::list_images;
use super::network::network_args;
use super::{target_machine, ERR_VM_NOT_FOUND};
use crate::dispatch::{ResourceModule, VerbFn};
use crate::render;
use crate::request::Request;
use qmanager_common::process::{resolve_within, PKILL};
use qmanager_common::{
    random_mac, Architecture, Error, Filter, NetworkInterface, Result, Validator, Value,
    VirtualMachine, DEFAULT_NETWORK_ADAPTER, TABLE_FORWARD, TABLE_INTERFACE, TABLE_VM,
};
use std::path::Path;
use tracing::{info, warn};

const ROUTE: &str = "machine/manage";

pub struct MachineModule;

const VERBS: &[(&str, VerbFn<MachineModule>)] = &[
    ("list", list),
    ("create", create),
    ("start", start),
    ("stop", stop),
    ("delete", delete),
];

const MENU: &[(&str, &str)] = &[("list", "List VM"), ("create", "Create VM")];

impl ResourceModule for MachineModule {
    const ROUTE: &'static str = ROUTE;
    const LABEL: &'static str = "Virtual Machines";

    fn verbs(&self) -> &'static [(&'static str, VerbFn<Self>)] {
        VERBS
    }

    fn menu(&self) -> &'static [(&'static str, &'static str)] {
        MENU
    }

    fn state(&self, request: &Request<'_>) -> String {
        match request.ctx.store().count(TABLE_VM, &Filter::all()) {
            Ok(n) => format!("Virtual machines: {}", n),
            Err(e) => {
                warn!(error = %e, "Cannot count virtual machines");
                "Error getting machine state".to_string()
            }
        }
    }
}

fn list(_: &MachineModule, request: &Request<'_>, _: &[String]) -> Result<String> {
    let store = request.ctx.store();
    let machines = store.select(TABLE_VM, &["*"], &Filter::all(), None)?;
    if machines.is_empty() {
        return Ok(format!(
            "<p>No virtual machines configured.</p>{}",
            render::link_button(&request.link(&format!("{}/create", ROUTE)), "Create VM")
        ));
    }

    let mut rows = Vec::with_capacity(machines.len());
    for row in &machines {
        let vm = VirtualMachine::from_row(row);
        let iface = store
            .find(TABLE_INTERFACE, &Filter::new().eq("machine_name", vm.name.as_str()))?
            .map(|r| NetworkInterface::from_row(&r));
        let (mac, ip) = match &iface {
            Some(i) => (i.mac.as_str(), i.ip.as_deref().unwrap_or("DHCP")),
            None => ("", "DHCP"),
        };
        let action = |verb: &str, label: &str| {
            render::link_button(&request.link(&format!("{}/{}/{}", ROUTE, verb, vm.name)), label)
        };
        rows.push(vec![
            render::escape(&vm.name),
            render::escape(&vm.platform),
            vm.cpu.to_string(),
            format!("{} MB", vm.memory),
            render::escape(vm.hda.as_deref().unwrap_or("")),
            render::escape(mac),
            render::escape(ip),
            [
                action("start", "Start"),
                action("stop", "Stop"),
                action("delete", "Delete"),
            ]
            .join(" "),
        ]);
    }

    Ok(render::table(
        &["Name", "Platform", "CPU", "RAM", "Disk", "MAC", "IP", "Actions"],
        &rows,
    ))
}

fn image_names(root: &Path) -> Result<Vec<String>> {
    Ok(list_images(root)?.into_iter().map(|(name, _)| name).collect())
}

fn create(_: &MachineModule, request: &Request<'_>, _: &[String]) -> Result<String> {
    let ctx = request.ctx;
    let images = image_names(&ctx.config.images_dir)?;

    if !request.is_post() {
        if images.is_empty() {
            return Ok(format!(
                "<p>No disk images available. Create one first.</p>{}",
                render::link_button(&request.link("image/manage/create"), "Create image")
            ));
        }
        let fields = [
            render::input("Machine name", "machine-name", "text", ""),
            render::input("CPU cores", "machine-cpu", "number", "1"),
            render::input("RAM (MB)", "machine-ram", "number", "512"),
            render::select(
                "Disk image",
                "machine-image",
                &super::options(images.as_slice()),
                "",
            ),
        ]
        .concat();
        return Ok(format!(
            "<h3>Create virtual machine</h3>{}",
            render::form(&request.link(&format!("{}/create", ROUTE)), &fields, "Create")
        ));
    }

    let store = ctx.store();
    let mut v = Validator::new(request.form.clone());
    v.required_msg("machine-name", "Machine name is required")
        .machine_name("machine-name")
        .unique(
            store,
            "machine-name",
            TABLE_VM,
            "name",
            Some("Virtual machine with this name already exists"),
            &[],
        )
        .required("machine-cpu")
        .integer("machine-cpu")
        .range("machine-cpu", 1, 32)
        .required("machine-ram")
        .integer("machine-ram")
        .range("machine-ram", 128, 32768)
        .required("machine-image")
        .custom("machine-image", "Selected image does not exist", |v| {
            images.iter().any(|name| name == v)
        });
    v.finish()?;

    let name = request.field("machine-name");
    let cpu: i64 = request.field("machine-cpu").trim().parse().unwrap_or(1);
    let memory: i64 = request.field("machine-ram").trim().parse().unwrap_or(128);
    let image = request.field("machine-image");
    let platform = ctx.config.default_arch;

    store
        .insert(
            TABLE_VM,
            &vec![
                ("name", Value::from(name)),
                ("platform", Value::from(platform.as_str())),
                ("hda", Value::from(image)),
                ("memory", Value::from(memory)),
                ("cpu", Value::from(cpu)),
                ("boot", Value::from("c")),
            ],
        )
        .map_err(|e| {
            if e.is_constraint() {
                Error::invalid("machine-name: Virtual machine with this name already exists")
            } else {
                e
            }
        })?;

    let mac = random_mac();
    store.insert(
        TABLE_INTERFACE,
        &vec![
            ("machine_name", Value::from(name)),
            ("mac", Value::from(&mac)),
            ("model", Value::from(DEFAULT_NETWORK_ADAPTER)),
        ],
    )?;
    info!(machine = name, platform = %platform, cpu, memory, image, mac = %mac, "Virtual machine created");

    Ok(render::success_block(
        "Virtual machine created",
        &format!(
            "<ul><li>Name: {}</li><li>Platform: {}</li><li>CPU: {}</li><li>RAM: {} MB</li>\
             <li>Disk: {}</li><li>MAC: {}</li></ul><p>{}</p>",
            render::escape(name),
            platform,
            cpu,
            memory,
            render::escape(image),
            mac,
            render::link_button(&request.link(&format!("{}/start/{}", ROUTE, name)), "Start")
        ),
    ))
}

/// Resolve a stored image path, mapping failures to `missing` / `invalid`
fn media_path(root: &Path, stored: &str, missing: &str, invalid: &str) -> Result<String> {
    match resolve_within(root, stored) {
        Ok(path) => Ok(path.display().to_string()),
        Err(Error::NotFound { .. }) => Err(Error::invalid(missing)),
        Err(Error::PathEscape(_)) => Err(Error::invalid(invalid)),
        Err(e) => Err(e),
    }
}

/// Emulator argv for `vm`, without the program name
fn launch_args(request: &Request<'_>, vm: &VirtualMachine) -> Result<Vec<String>> {
    let root = &request.ctx.config.images_dir;
    let mut argv = vec![
        "-name".to_string(),
        vm.name.clone(),
        "-m".to_string(),
        vm.memory.to_string(),
        "-smp".to_string(),
        vm.cpu.to_string(),
    ];
    if let Some(hda) = vm.hda.as_deref().filter(|s| !s.is_empty()) {
        argv.push("-hda".to_string());
        argv.push(media_path(
            root,
            hda,
            "Disk image file does not exist",
            "Invalid disk image path",
        )?);
    }
    if let Some(cdrom) = vm.cdrom.as_deref().filter(|s| !s.is_empty()) {
        argv.push("-cdrom".to_string());
        argv.push(media_path(
            root,
            cdrom,
            "CDROM image file does not exist",
            "Invalid CDROM image path",
        )?);
    }
    argv.extend(network_args(request.ctx.store(), &vm.name)?);
    argv.push("-boot".to_string());
    argv.push(vm.boot.clone());
    argv.push("-daemonize".to_string());
    Ok(argv)
}

fn start(_: &MachineModule, request: &Request<'_>, args: &[String]) -> Result<String> {
    let name = target_machine(request, args)?;
    let vm = request
        .ctx
        .store()
        .find(TABLE_VM, &Filter::new().eq("name", name.as_str()))?
        .map(|row| VirtualMachine::from_row(&row))
        .ok_or_else(|| Error::invalid(format!("machine_name: {}", ERR_VM_NOT_FOUND)))?;

    let arch: Architecture = vm
        .platform
        .parse()
        .map_err(|_| Error::invalid(format!("platform: Unsupported platform {}", vm.platform)))?;
    let argv = launch_args(request, &vm)?;
    request.ctx.invoker.run_checked(&arch.system_binary(), &argv)?;
    info!(machine = %name, platform = %arch, "Virtual machine started");

    Ok(render::success_block(
        "Started",
        &format!(
            "<p>Virtual machine started successfully: '{}'</p>",
            render::escape(&name)
        ),
    ))
}

fn stop(_: &MachineModule, request: &Request<'_>, args: &[String]) -> Result<String> {
    let name = target_machine(request, args)?;
    // Machine names carry no regex metacharacters; the name must end at a
    // space or the end of the command line so `vm1` leaves `vm10` alone
    let argv = vec!["-f".to_string(), format!("qemu-system.*-name {}( |$)", name)];
    let outcome = request.ctx.invoker.run(PKILL, &argv);

    match outcome.exit_code {
        0 => {
            info!(machine = %name, "Stop signal sent");
            Ok(render::success_block(
                "Stopped",
                &format!(
                    "<p>Virtual machine stop signal sent: '{}'</p>",
                    render::escape(&name)
                ),
            ))
        }
        // pkill: no process matched
        1 => Ok(format!(
            "<p>No running process found for '{}'.</p>",
            render::escape(&name)
        )),
        _ => {
            let command = qmanager_common::ProcessInvoker::command_line(PKILL, &argv);
            outcome.into_result(&command).map(|_| String::new())
        }
    }
}

fn delete(_: &MachineModule, request: &Request<'_>, args: &[String]) -> Result<String> {
    let name = target_machine(request, args)?;
    let store = request.ctx.store();
    let by_name = Filter::new().eq("name", name.as_str());
    let by_machine = Filter::new().eq("machine_name", name.as_str());

    store.delete(TABLE_VM, &by_name)?;
    let interfaces = store.delete(TABLE_INTERFACE, &by_machine)?;
    let forwards = store.delete(TABLE_FORWARD, &by_machine)?;
    info!(machine = %name, interfaces, forwards, "Virtual machine deleted");

    Ok(render::success_block(
        "Deleted",
        &format!(
            "<p>Virtual machine deleted: '{}'</p><p>{}</p>",
            render::escape(&name),
            render::link_button(&request.link(&format!("{}/list", ROUTE)), "Back to list")
        ),
    ))
}
