// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use slog::{info, o, Logger};
use vmops::assemble::{plan_clone, plan_reconfigure, CloneRequest};
use vmops::devices::RawDevice;
use vmops::policy::Strictness;
use vmops_config_toml::Plan;

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Plans vCenter VM reconfigurations and clones without submitting them
struct Opt {
    /// Enable debugging
    #[clap(short, long, action)]
    debug: bool,

    /// Refuse requests that would otherwise fall back to defaults
    #[clap(long, action)]
    strict: bool,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the reconfigure request for a VM
    Reconfigure {
        /// File with a JSON array of the VM's current devices
        #[clap(long, action)]
        devices: PathBuf,

        /// TOML plan file
        #[clap(long, action)]
        plan: PathBuf,
    },

    /// Print the clone request for a source VM or template
    Clone {
        /// File with a JSON array of the source VM's current devices
        #[clap(long, action)]
        devices: PathBuf,

        /// TOML plan file; must have a [clone] section
        #[clap(long, action)]
        plan: PathBuf,
    },
}

#[derive(Serialize)]
struct CloneOutput<'a> {
    name: &'a str,
    folder: &'a str,
    request: &'a CloneRequest,
}

fn parse_json_file<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> anyhow::Result<T> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader).map_err(|e| e.into())
}

fn load(
    devices: &Path,
    plan: &Path,
    strict: bool,
) -> anyhow::Result<(Vec<RawDevice>, Plan)> {
    let devices: Vec<RawDevice> = parse_json_file(devices)
        .with_context(|| format!("reading devices from {}", devices.display()))?;

    let config = vmops_config_toml::parse(plan)
        .with_context(|| format!("reading plan from {}", plan.display()))?;
    let mut plan = Plan::try_from(&config)
        .with_context(|| format!("invalid plan {}", plan.display()))?;

    if strict {
        plan.policy.strictness = Strictness::Strict;
    }
    Ok((devices, plan))
}

fn run(opt: &Opt, log: &Logger, out: &mut impl Write) -> anyhow::Result<()> {
    match &opt.cmd {
        Command::Reconfigure { devices, plan } => {
            let (devices, plan) = load(devices, plan, opt.strict)?;
            let req = plan_reconfigure(
                &devices,
                &plan.intent,
                &plan.board,
                &plan.policy,
                log,
            )
            .context("failed to plan reconfiguration")?;

            info!(log, "planned reconfiguration";
                  "changes" => req.device_change.len());
            serde_json::to_writer_pretty(&mut *out, &req)?;
        }
        Command::Clone { devices, plan } => {
            let (devices, plan) = load(devices, plan, opt.strict)?;
            let target = plan
                .clone
                .as_ref()
                .ok_or_else(|| anyhow!("plan has no [clone] section"))?;
            let req = plan_clone(
                &devices,
                &plan.intent,
                &plan.board,
                &target.settings,
                &plan.policy,
                log,
            )
            .context("failed to plan clone")?;

            info!(log, "planned clone";
                  "name" => target.name.as_str(),
                  "changes" => req.config.device_change.len(),
                  "relocated_disks" => req.location.disk.len());
            let output = CloneOutput {
                name: &target.name,
                folder: &target.folder,
                request: &req,
            };
            serde_json::to_writer_pretty(&mut *out, &output)?;
        }
    }
    writeln!(out)?;
    Ok(())
}

fn build_logger(level: slog::Level) -> slog::Logger {
    use slog::Drain;

    // stdout carries the planned request, so logs go to stderr.
    let main_drain = if atty::is(atty::Stream::Stderr) {
        let decorator = slog_term::TermDecorator::new().stderr().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain = slog_bunyan::with_name("vmops-cli", std::io::stderr())
            .build()
            .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let filtered_main = slog::LevelFilter::new(main_drain, level);
    slog::Logger::root(filtered_main.fuse(), o!())
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    let level = if opt.debug { slog::Level::Debug } else { slog::Level::Info };
    let log = build_logger(level);

    let stdout = std::io::stdout();
    run(&opt, &log, &mut stdout.lock())
}

#[cfg(test)]
mod test {
    use super::*;

    const DEVICES: &str = r#"[
        {"key": 1000, "type": "ParaVirtualSCSIController", "busNumber": 0,
         "sharedBus": "noSharing", "device": [2000]},
        {"key": 2000, "type": "VirtualDisk", "controllerKey": 1000,
         "unitNumber": 0, "capacityInKB": 16777216,
         "backing": {"kind": "flatVer2", "fileName": "[ds1] vm/vm.vmdk",
                     "datastore": "datastore-1", "diskMode": "persistent",
                     "thinProvisioned": true}},
        {"key": 4000, "type": "VirtualVmxnet3",
         "backing": {"kind": "network", "network": "network-1",
                     "deviceName": "VM Network"}}
    ]"#;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn run_with(cmd: Command, strict: bool) -> anyhow::Result<serde_json::Value> {
        let opt = Opt { debug: false, strict, cmd };
        let mut out = Vec::new();
        run(&opt, &logger(), &mut out)?;
        Ok(serde_json::from_slice(&out).unwrap())
    }

    #[test]
    fn reconfigure_prints_request() {
        let devices = write_temp(DEVICES);
        let plan = write_temp(
            "[board]\nmemory_mb = 4096\n\n[[disk]]\nsize_gb = 1\ntype = \"thin\"",
        );

        let value = run_with(
            Command::Reconfigure {
                devices: devices.path().to_owned(),
                plan: plan.path().to_owned(),
            },
            false,
        )
        .unwrap();

        assert_eq!(value["memoryMB"], 4096);
        let change = &value["deviceChange"][0];
        assert_eq!(change["operation"], "add");
        assert_eq!(change["fileOperation"], "create");
        assert_eq!(change["device"]["unitNumber"], 1);
    }

    #[test]
    fn strict_flag_overrides_plan() {
        let devices = write_temp(DEVICES);
        let plan = write_temp("[[disk]]\nsize_gb = 1\ntype = \"sparse\"");

        let cmd = || Command::Reconfigure {
            devices: devices.path().to_owned(),
            plan: plan.path().to_owned(),
        };
        assert!(run_with(cmd(), false).is_ok());
        assert!(run_with(cmd(), true).is_err());
    }

    #[test]
    fn clone_requires_clone_section() {
        let devices = write_temp(DEVICES);
        let plan = write_temp("[board]\ncpus = 2");

        let err = run_with(
            Command::Clone {
                devices: devices.path().to_owned(),
                plan: plan.path().to_owned(),
            },
            false,
        )
        .unwrap_err();
        assert!(err.to_string().contains("[clone]"));
    }

    #[test]
    fn clone_prints_target_and_request() {
        let devices = write_temp(DEVICES);
        let plan = write_temp(
            r#"
[[disk]]
existing_key = 2000
size_gb = 32
datastore = "datastore-2"

[clone]
name = "web-02"
folder = "group-v3"
power_on = true

[clone.customization]
family = "linux"
"#,
        );

        let value = run_with(
            Command::Clone {
                devices: devices.path().to_owned(),
                plan: plan.path().to_owned(),
            },
            false,
        )
        .unwrap();

        assert_eq!(value["name"], "web-02");
        assert_eq!(value["folder"], "group-v3");
        assert_eq!(value["request"]["powerOn"], true);
        assert_eq!(value["request"]["location"]["disk"][0]["diskId"], 2000);
        assert_eq!(
            value["request"]["customization"]["identity"]["hostName"]["name"],
            "web-02"
        );
    }

    #[test]
    fn missing_devices_file_names_the_path() {
        let plan = write_temp("");
        let err = run_with(
            Command::Reconfigure {
                devices: PathBuf::from("/nonexistent/devices.json"),
                plan: plan.path().to_owned(),
            },
            false,
        )
        .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/devices.json"));
    }
}
