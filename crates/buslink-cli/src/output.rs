use std::io::IsTerminal;

use buslink::{DeviceSettings, DeviceView};
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

pub fn print_devices(devices: &[DeviceView], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(devices).unwrap_or_else(|_| "[]".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["PATH", "STATUS", "NODE ID", "NODE NAME"]);
            for device in devices {
                table.add_row(vec![
                    device.path.clone(),
                    device.status.to_string(),
                    device
                        .node_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    device.node_name.clone().unwrap_or_else(|| "-".to_string()),
                ]);
            }
            println!("{table}");
        }
    }
}

#[derive(Serialize)]
struct SettingsOutput<'a> {
    path: &'a str,
    #[serde(flatten)]
    settings: &'a DeviceSettings,
}

pub fn print_settings(path: &str, settings: &DeviceSettings, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = SettingsOutput { path, settings };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            table.add_row(vec!["path".to_string(), path.to_string()]);
            table.add_row(vec![
                "interface".to_string(),
                settings.interface.to_string(),
            ]);
            table.add_row(vec![
                "bulk in".to_string(),
                format!(
                    "{:#04x} (packet {}, buffer {})",
                    settings.bulk_in.address,
                    settings.bulk_in.max_packet_size,
                    settings.bulk_in.buffer_size
                ),
            ]);
            table.add_row(vec![
                "bulk out".to_string(),
                format!(
                    "{:#04x} (packet {}, buffer {})",
                    settings.bulk_out.address,
                    settings.bulk_out.max_packet_size,
                    settings.bulk_out.buffer_size
                ),
            ]);
            table.add_row(vec![
                "node id".to_string(),
                settings
                    .node_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ]);
            table.add_row(vec![
                "node name".to_string(),
                settings.node_name.clone().unwrap_or_else(|| "-".to_string()),
            ]);
            table.add_row(vec![
                "protocol versions".to_string(),
                settings
                    .protocol_versions
                    .iter()
                    .map(u16::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            ]);
            println!("{table}");
        }
    }
}
