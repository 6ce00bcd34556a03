//! Scripted host for tests.
//!
//! [`FakeHost`] implements [`Runner`] by simulating the package managers,
//! systemd, the shadow tools and xorriso against in-memory state, writing to
//! the filesystem only below paths the commands name (a `--prefix`, a venv,
//! an xorriso output). Every command is recorded.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::preflight::HostFacts;
use crate::process::{Cmd, CmdResult, Runner};

/// Tools present on a fresh [`FakeHost`].
pub const DEFAULT_TOOLS: &[&str] = &[
    "apt-get",
    "dpkg-query",
    "systemctl",
    "journalctl",
    "useradd",
    "groupadd",
    "python3",
    "npm",
    "ollama",
    "curl",
    "sh",
    "xorriso",
];

pub const SAMPLE_GRUB_CFG: &str = "set timeout=30\n\
loadfont unicode\n\
\n\
menuentry \"Try or Install Ubuntu\" {\n\
\tset gfxpayload=keep\n\
\tlinux\t/casper/vmlinuz  ---\n\
\tinitrd\t/casper/initrd\n\
}\n\
menuentry \"Ubuntu (safe graphics)\" {\n\
\tset gfxpayload=keep\n\
\tlinux\t/casper/vmlinuz  nomodeset  ---\n\
\tinitrd\t/casper/initrd\n\
}\n";

/// Host facts that satisfy the default requirements.
pub fn sample_facts() -> HostFacts {
    HostFacts {
        os_id: "ubuntu".into(),
        os_version: "22.04".into(),
        arch: "x86_64".into(),
        total_memory_mb: 32 * 1024,
        available_disk_mb: 200 * 1024,
    }
}

#[derive(Default)]
struct State {
    tools: BTreeSet<String>,
    apt: BTreeSet<String>,
    pip: BTreeSet<String>,
    npm: BTreeSet<String>,
    ollama_models: BTreeSet<String>,
    /// Units systemd has loaded.
    known: BTreeSet<String>,
    enabled: BTreeSet<String>,
    active: BTreeSet<String>,
    never_active: BTreeSet<String>,
    journal: String,
    failures: BTreeMap<String, (i32, String)>,
    grub_cfg: Option<String>,
    corrupt_iso: bool,
    calls: Vec<Cmd>,
}

pub struct FakeHost {
    state: RefCell<State>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    pub fn new() -> Self {
        let state = State {
            tools: DEFAULT_TOOLS.iter().map(|t| t.to_string()).collect(),
            grub_cfg: Some(SAMPLE_GRUB_CFG.to_string()),
            ..State::default()
        };
        Self {
            state: RefCell::new(state),
        }
    }

    pub fn without_tool(self, tool: &str) -> Self {
        self.state.borrow_mut().tools.remove(tool);
        self
    }

    pub fn with_tool(self, tool: &str) -> Self {
        self.state.borrow_mut().tools.insert(tool.to_string());
        self
    }

    pub fn with_apt<I, S>(self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .borrow_mut()
            .apt
            .extend(packages.into_iter().map(Into::into));
        self
    }

    pub fn with_ollama_models<I, S>(self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .borrow_mut()
            .ollama_models
            .extend(models.into_iter().map(Into::into));
        self
    }

    /// Every invocation of `program` exits with `code` and `stderr`.
    pub fn fail(self, program: &str, code: i32, stderr: &str) -> Self {
        self.state
            .borrow_mut()
            .failures
            .insert(program.to_string(), (code, stderr.to_string()));
        self
    }

    /// A unit file systemd has loaded. Starting or enabling a unit also loads it.
    pub fn with_unit(self, unit: &str) -> Self {
        self.state.borrow_mut().known.insert(unit.to_string());
        self
    }

    /// `systemctl start` succeeds but the unit never reports active.
    pub fn never_active(self, unit: &str) -> Self {
        self.state.borrow_mut().never_active.insert(unit.to_string());
        self
    }

    pub fn with_journal(self, text: &str) -> Self {
        self.state.borrow_mut().journal = text.to_string();
        self
    }

    /// Base images have no `/boot/grub/grub.cfg`.
    pub fn without_grub_cfg(self) -> Self {
        self.state.borrow_mut().grub_cfg = None;
        self
    }

    /// xorriso writes an output without an ISO 9660 signature.
    pub fn corrupt_iso(self) -> Self {
        self.state.borrow_mut().corrupt_iso = true;
        self
    }

    /// Rendered command lines for `program` (matched on the basename).
    pub fn calls_to(&self, program: &str) -> Vec<String> {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|cmd| basename(cmd.program()) == program)
            .map(|cmd| cmd.to_string())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.state.borrow().calls.len()
    }

    /// Calls that would change host state (installs, account and unit edits).
    pub fn mutating_calls(&self) -> Vec<String> {
        const QUERIES: &[&str] = &[
            "is-enabled",
            "is-active",
            "show",
            "list",
            "ls",
            "-W",
            "--version",
        ];
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|cmd| {
                let args = cmd.get_args();
                let prog = basename(cmd.program());
                if prog == "journalctl" {
                    return false;
                }
                if prog == "pip" && args.first().map(String::as_str) == Some("show") {
                    return false;
                }
                !args.iter().any(|a| QUERIES.contains(&a.as_str()))
            })
            .map(|cmd| cmd.to_string())
            .collect()
    }

    pub fn unit_active(&self, unit: &str) -> bool {
        self.state.borrow().active.contains(unit)
    }

    pub fn unit_enabled(&self, unit: &str) -> bool {
        self.state.borrow().enabled.contains(unit)
    }

    fn simulate(&self, cmd: &Cmd) -> io::Result<CmdResult> {
        let program = basename(cmd.program()).to_string();
        let args: Vec<String> = cmd.get_args().to_vec();
        let mut st = self.state.borrow_mut();

        if let Some((code, stderr)) = st.failures.get(&program) {
            return Ok(CmdResult::failed(*code, stderr.clone()));
        }

        let positional = |args: &[String]| -> Vec<String> {
            args.iter().filter(|a| !a.starts_with('-')).cloned().collect()
        };

        let result = match program.as_str() {
            "dpkg-query" => {
                let pkg = args.last().cloned().unwrap_or_default();
                if st.apt.contains(&pkg) {
                    CmdResult::ok("install ok installed")
                } else {
                    CmdResult::failed(1, format!("dpkg-query: no packages found matching {pkg}"))
                }
            }
            "apt-get" => {
                if args.first().map(String::as_str) == Some("install") {
                    let pkgs = positional(&args[1..]);
                    st.apt.extend(pkgs);
                }
                CmdResult::ok("")
            }
            "python3" => {
                if args.len() >= 3 && args[0] == "-m" && args[1] == "venv" {
                    let venv = PathBuf::from(&args[2]);
                    fs::create_dir_all(venv.join("bin"))?;
                    fs::write(venv.join("bin/python"), "")?;
                    fs::write(venv.join("bin/pip"), "")?;
                }
                CmdResult::ok("")
            }
            "pip" => match args.first().map(String::as_str) {
                Some("show") => {
                    let name = args.last().cloned().unwrap_or_default();
                    if st.pip.contains(&name) {
                        CmdResult::ok("")
                    } else {
                        CmdResult::failed(1, format!("WARNING: Package(s) not found: {name}"))
                    }
                }
                Some("install") => {
                    for spec in positional(&args[1..]) {
                        let name = spec
                            .split(|c: char| "<>=!~[; ".contains(c))
                            .next()
                            .unwrap_or(&spec)
                            .to_string();
                        st.pip.insert(name);
                    }
                    CmdResult::ok("")
                }
                _ => CmdResult::ok(""),
            },
            "npm" => match args.first().map(String::as_str) {
                Some("ls") => {
                    let pkg = args.last().cloned().unwrap_or_default();
                    if st.npm.contains(&pkg) {
                        CmdResult::ok(format!("/usr/lib/node_modules/{pkg}\n"))
                    } else {
                        CmdResult::failed(1, "")
                    }
                }
                Some("install") => {
                    st.npm.extend(positional(&args[1..]));
                    CmdResult::ok("")
                }
                _ => CmdResult::ok(""),
            },
            "ollama" => match args.first().map(String::as_str) {
                Some("list") => {
                    let mut out = String::from("NAME\tID\tSIZE\tMODIFIED\n");
                    for model in &st.ollama_models {
                        out.push_str(&format!("{model}\tabc123\t4.7 GB\t1 day ago\n"));
                    }
                    CmdResult::ok(out)
                }
                Some("pull") => {
                    if let Some(model) = args.get(1) {
                        st.ollama_models.insert(model.clone());
                    }
                    CmdResult::ok("")
                }
                _ => CmdResult::ok(""),
            },
            "sh" => {
                if args.iter().any(|a| a.contains("ollama")) {
                    st.tools.insert("ollama".into());
                }
                CmdResult::ok("")
            }
            "systemctl" => {
                let rest: Vec<&String> = args.iter().filter(|a| !a.starts_with("--root=")).collect();
                let action = rest.first().map(|s| s.as_str()).unwrap_or("");
                let unit = rest.last().map(|s| s.to_string()).unwrap_or_default();
                match action {
                    "is-enabled" if st.enabled.contains(&unit) => CmdResult::ok("enabled\n"),
                    "is-enabled" => CmdResult {
                        code: Some(1),
                        stdout: "disabled\n".into(),
                        stderr: String::new(),
                    },
                    "enable" => {
                        st.known.insert(unit.clone());
                        st.enabled.insert(unit);
                        CmdResult::ok("")
                    }
                    "disable" | "stop" if !st.known.contains(&unit) => CmdResult::failed(
                        5,
                        format!("Failed to {action} {unit}: Unit {unit} not loaded."),
                    ),
                    "disable" => {
                        st.enabled.remove(&unit);
                        CmdResult::ok("")
                    }
                    "start" => {
                        st.known.insert(unit.clone());
                        if !st.never_active.contains(&unit) {
                            st.active.insert(unit);
                        }
                        CmdResult::ok("")
                    }
                    "stop" => {
                        st.active.remove(&unit);
                        CmdResult::ok("")
                    }
                    "is-active" if st.active.contains(&unit) => CmdResult::ok("active\n"),
                    "is-active" => CmdResult {
                        code: Some(3),
                        stdout: "inactive\n".into(),
                        stderr: String::new(),
                    },
                    "show" if rest.iter().any(|a| *a == "--property=LoadState") => {
                        if st.known.contains(&unit) {
                            CmdResult::ok("loaded\n")
                        } else {
                            CmdResult::ok("not-found\n")
                        }
                    }
                    "show" if st.active.contains(&unit) => CmdResult::ok("4242\n"),
                    "show" => CmdResult::ok("0\n"),
                    _ => CmdResult::ok(""),
                }
            }
            "journalctl" => CmdResult::ok(st.journal.clone()),
            "groupadd" => {
                if let Some(root) = flag_value(&args, "--prefix") {
                    let name = args.last().cloned().unwrap_or_default();
                    let gid = nix::unistd::getegid().as_raw();
                    append_line(&Path::new(&root).join("etc/group"), &format!("{name}:x:{gid}:"))?;
                }
                CmdResult::ok("")
            }
            "useradd" => {
                if let Some(root) = flag_value(&args, "--prefix") {
                    let name = args.last().cloned().unwrap_or_default();
                    let home = flag_value(&args, "--home-dir").unwrap_or_default();
                    let shell = flag_value(&args, "--shell").unwrap_or_default();
                    let uid = nix::unistd::geteuid().as_raw();
                    let gid = nix::unistd::getegid().as_raw();
                    append_line(
                        &Path::new(&root).join("etc/passwd"),
                        &format!("{name}:x:{uid}:{gid}::{home}:{shell}"),
                    )?;
                }
                CmdResult::ok("")
            }
            "xorriso" => self.simulate_xorriso(&st, &args)?,
            _ => CmdResult::ok(""),
        };
        Ok(result)
    }

    fn simulate_xorriso(&self, st: &State, args: &[String]) -> io::Result<CmdResult> {
        if let Some(pos) = args.iter().position(|a| a == "-extract") {
            let Some(grub) = &st.grub_cfg else {
                return Ok(CmdResult::failed(
                    5,
                    "xorriso : FAILURE : Cannot determine attributes of (ISO) source file '/boot/grub/grub.cfg'",
                ));
            };
            if let Some(dest) = args.get(pos + 2) {
                let dest = Path::new(dest);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(dest, grub)?;
            }
            return Ok(CmdResult::ok(""));
        }
        if let Some(out) = flag_value(args, "-outdev") {
            let mut image = vec![0u8; 64 * 1024];
            if !st.corrupt_iso {
                image[32769..32774].copy_from_slice(b"CD001");
            }
            fs::write(out, image)?;
        }
        Ok(CmdResult::ok(""))
    }
}

impl Runner for FakeHost {
    fn exec(&self, cmd: &Cmd) -> io::Result<CmdResult> {
        self.state.borrow_mut().calls.push(cmd.clone());
        self.simulate(cmd)
    }

    fn find_tool(&self, name: &str) -> Option<PathBuf> {
        self.state
            .borrow()
            .tools
            .contains(name)
            .then(|| PathBuf::from("/usr/bin").join(name))
    }
}

fn basename(program: &str) -> &str {
    program.rsplit('/').next().unwrap_or(program)
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn append_line(path: &Path, line: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}
