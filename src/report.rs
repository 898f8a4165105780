//! Rendering of exposure reports

use crate::{
    classifier::{ClassifiedDevice, DeviceFilter, ExposureReport},
    error::Result,
};
use std::fmt::Write;

/// Output format of the `exposed` command
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

pub fn render(report: &ExposureReport, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(render_text(report)),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(report)?),
    }
}

fn heading(filter: DeviceFilter) -> &'static str {
    match filter {
        DeviceFilter::Block => "Exposed block devices",
        DeviceFilter::Char => "Exposed character devices",
        DeviceFilter::Socket => "Exposed sockets",
    }
}

fn describe(device: &ClassifiedDevice) -> String {
    let mut line = format!(
        "{} {} {}:{}",
        device.permissions, device.name, device.owner, device.group
    );
    match (&device.major, &device.subsystem) {
        (Some(major), Some(name)) => {
            let _ = write!(line, " [{major} {name}]");
        }
        (Some(major), None) => {
            let _ = write!(line, " [{major} unknown]");
        }
        _ if device.unmappable => line.push_str(" [unmappable major]"),
        _ => {}
    }
    line
}

/// Plain text, one section per requested device type
pub fn render_text(report: &ExposureReport) -> String {
    let mut out = String::new();
    let groups = report.acting_groups.join(",");
    let _ = writeln!(out, "Acting as {} (groups: {groups})", report.acting_user);
    if report.new_only {
        out.push_str("Only devices absent from the baseline are listed\n");
    }

    for group in &report.groups {
        let _ = writeln!(out, "\n{} ({}):", heading(group.filter), group.devices.len());
        if group.devices.is_empty() {
            out.push_str("  none\n");
        }
        for device in &group.devices {
            let _ = writeln!(out, "  {}", describe(device));
        }
    }
    out
}
