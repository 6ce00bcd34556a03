//! GRUB boot menu rewriting.

use anyhow::{bail, Result};

use super::BootEntry;

/// Kernel arguments pointing cloud-init at the seed on the install medium.
/// The `;` is escaped for GRUB.
pub const NOCLOUD_ARGS: &[&str] = &["autoinstall", "ds=nocloud\\;s=/cdrom/nocloud/"];

/// Kernel and initrd lines of the first entry in the base menu.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BootFiles {
    kernel: String,
    initrd: String,
}

fn first_boot_files(grub_cfg: &str) -> Option<BootFiles> {
    let mut in_entry = false;
    let mut kernel = None;
    for line in grub_cfg.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("menuentry ") {
            in_entry = true;
            kernel = None;
            continue;
        }
        if !in_entry {
            continue;
        }
        let mut parts = trimmed.split_whitespace();
        match parts.next() {
            Some("linux") | Some("linuxefi") => kernel = parts.next().map(str::to_string),
            Some("initrd") | Some("initrdefi") => {
                let initrd: Vec<&str> = parts.collect();
                if let (Some(kernel), false) = (kernel.clone(), initrd.is_empty()) {
                    return Some(BootFiles {
                        kernel,
                        initrd: initrd.join(" "),
                    });
                }
            }
            Some("}") => in_entry = false,
            _ => {}
        }
    }
    None
}

/// Titles of the existing `menuentry` lines.
pub fn entry_titles(grub_cfg: &str) -> Vec<String> {
    grub_cfg
        .lines()
        .filter_map(|line| line.trim().strip_prefix("menuentry "))
        .filter_map(|rest| {
            let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
            let inner = &rest[1..];
            inner.find(quote).map(|end| inner[..end].to_string())
        })
        .collect()
}

fn render_entry(entry: &BootEntry, files: &BootFiles) -> String {
    let mut args: Vec<&str> = Vec::new();
    if entry.autoinstall {
        args.extend_from_slice(NOCLOUD_ARGS);
    }
    args.extend(entry.kernel_args.iter().map(String::as_str));
    args.push("---");
    format!(
        "menuentry \"{}\" {{\n\tset gfxpayload=keep\n\tlinux\t{} {}\n\tinitrd\t{}\n}}\n",
        entry.title.replace('"', "\\\""),
        files.kernel,
        args.join(" "),
        files.initrd
    )
}

/// Prepend `entries` to the menu, reusing the kernel and initrd of the first
/// existing entry. Entries whose title is already present are left alone, so
/// rewriting an already rewritten menu returns it unchanged.
pub fn add_entries(grub_cfg: &str, entries: &[BootEntry]) -> Result<String> {
    let existing = entry_titles(grub_cfg);
    let new: Vec<&BootEntry> = entries
        .iter()
        .filter(|e| !existing.iter().any(|t| *t == e.title))
        .collect();
    if new.is_empty() {
        return Ok(grub_cfg.to_string());
    }

    let Some(files) = first_boot_files(grub_cfg) else {
        bail!("boot menu has no menuentry with linux and initrd lines");
    };
    let rendered: String = new.iter().map(|e| render_entry(e, &files)).collect();

    let mut out = String::with_capacity(grub_cfg.len() + rendered.len());
    let mut inserted = false;
    for line in grub_cfg.split_inclusive('\n') {
        if !inserted && line.trim_start().starts_with("menuentry ") {
            out.push_str(&rendered);
            inserted = true;
        }
        out.push_str(line);
    }
    Ok(out)
}
