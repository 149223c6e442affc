//! Disk images under the configured images root

use crate::dispatch::{ResourceModule, VerbFn};
use crate::render;
use crate::request::Request;
use qmanager_common::process::{resolve_new_within, resolve_within, QEMU_IMG};
use qmanager_common::{format_size, Error, ImageFormat, ProcessInvoker, Result, Validator};
use std::path::Path;
use tracing::{info, warn};

const ROUTE: &str = "image/manage";
const IMAGE_EXT: &str = "img";

pub struct ImageModule;

const VERBS: &[(&str, VerbFn<ImageModule>)] = &[
    ("list", list),
    ("create", create),
    ("info", info),
    ("check", check),
];

const MENU: &[(&str, &str)] = &[("list", "List images"), ("create", "Create image")];

impl ResourceModule for ImageModule {
    const ROUTE: &'static str = ROUTE;
    const LABEL: &'static str = "Images";

    fn verbs(&self) -> &'static [(&'static str, VerbFn<Self>)] {
        VERBS
    }

    fn menu(&self) -> &'static [(&'static str, &'static str)] {
        MENU
    }

    fn state(&self, request: &Request<'_>) -> String {
        let outcome = request.ctx.invoker.run(QEMU_IMG, &["--version".to_string()]);
        match outcome.first_line() {
            line if outcome.is_error() || line.is_empty() => "unknown error".to_string(),
            line => line.to_string(),
        }
    }
}

/// `*.img` files directly under `root` with their sizes, sorted by name
pub(crate) fn list_images(root: &Path) -> Result<Vec<(String, u64)>> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(IMAGE_EXT) {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            images.push((name.to_string(), entry.metadata()?.len()));
        }
    }
    images.sort();
    Ok(images)
}

fn list(_: &ImageModule, request: &Request<'_>, _: &[String]) -> Result<String> {
    let images = list_images(&request.ctx.config.images_dir)?;
    if images.is_empty() {
        return Ok(format!(
            "<p>No disk images found.</p>{}",
            render::link_button(&request.link(&format!("{}/create", ROUTE)), "Create image")
        ));
    }

    let rows: Vec<Vec<String>> = images
        .iter()
        .map(|(name, size)| {
            let info = request.link(&format!("{}/info/{}", ROUTE, name));
            let check = request.link(&format!("{}/check/{}", ROUTE, name));
            vec![
                render::escape(name),
                format_size(*size),
                format!(
                    "{} {}",
                    render::link_button(&info, "Info"),
                    render::link_button(&check, "Check")
                ),
            ]
        })
        .collect();
    Ok(render::table(&["Name", "Size", "Actions"], &rows))
}

fn create(_: &ImageModule, request: &Request<'_>, _: &[String]) -> Result<String> {
    let config = &request.ctx.config;
    if !request.is_post() {
        let formats: Vec<&str> = ImageFormat::ALL.iter().map(|f| f.as_str()).collect();
        let fields = [
            render::input("Image name", "image-name", "text", ""),
            render::input("Size (MB)", "image-size", "number", "1024"),
            render::select(
                "Format",
                "image-format",
                &super::options(formats.as_slice()),
                ImageFormat::Qcow2.as_str(),
            ),
        ]
        .concat();
        return Ok(format!(
            "<h3>Create disk image</h3>{}",
            render::form(&request.link(&format!("{}/create", ROUTE)), &fields, "Create")
        ));
    }

    let formats: Vec<&str> = ImageFormat::ALL.iter().map(|f| f.as_str()).collect();
    let mut v = Validator::new(request.form.clone());
    v.required("image-name")
        .machine_name("image-name")
        .filename("image-name")
        .safe_path("image-name")
        .required("image-size")
        .integer("image-size")
        .range("image-size", 1, config.image_size_max_mb)
        .required("image-format")
        .one_of("image-format", &formats);
    v.finish()?;

    let name = request.field("image-name");
    let size: i64 = request.field("image-size").trim().parse().unwrap_or_default();
    let format = request.field("image-format");
    let file_name = format!("{}.{}", name, IMAGE_EXT);

    let path = resolve_new_within(&config.images_dir, &file_name)?;
    if path.exists() {
        return Err(Error::invalid("image-name: Image file already exists"));
    }

    let argv = [
        "create".to_string(),
        "-f".to_string(),
        format.to_string(),
        path.display().to_string(),
        format!("{}M", size),
    ];
    request.ctx.invoker.run_checked(QEMU_IMG, &argv)?;
    if !path.is_file() {
        warn!(image = %file_name, "qemu-img reported success but wrote no file");
        return Err(Error::Process {
            command: ProcessInvoker::command_line(QEMU_IMG, &argv),
            message: format!("Image file {} was not created", file_name),
        });
    }
    info!(image = %file_name, format, size_mb = size, "Disk image created");

    let on_disk = std::fs::metadata(&path)
        .map(|m| format_size(m.len()))
        .unwrap_or_else(|_| "unknown".to_string());
    Ok(render::success_block(
        "Disk image created",
        &format!(
            "<p>Image <strong>{}</strong> created.</p><ul><li>Format: {}</li><li>Size: {}</li>\
             <li>On disk: {}</li><li>Location: {}</li></ul>",
            render::escape(&file_name),
            render::escape(format),
            format_size(size as u64 * 1024 * 1024),
            render::escape(&on_disk),
            render::escape(&path.display().to_string())
        ),
    ))
}

/// Run `qemu-img <subcommand> <file>` on an existing image
fn inspect(request: &Request<'_>, subcommand: &str, args: &[String]) -> Result<String> {
    let file = args.join("/");
    let mut v = Validator::from_pairs([("file", file.as_str())]);
    v.required_msg("file", "Image file not specified")
        .safe_path("file");
    v.finish()?;

    let path = resolve_within(&request.ctx.config.images_dir, &file)?;
    let outcome = request.ctx.invoker.run_checked(
        QEMU_IMG,
        &[subcommand.to_string(), path.display().to_string()],
    )?;
    Ok(format!(
        "<h3>{} {}</h3>{}",
        render::escape(subcommand),
        render::escape(&file),
        render::pre(&outcome.lines)
    ))
}

fn info(_: &ImageModule, request: &Request<'_>, args: &[String]) -> Result<String> {
    inspect(request, "info", args)
}

fn check(_: &ImageModule, request: &Request<'_>, args: &[String]) -> Result<String> {
    inspect(request, "check", args)
}
