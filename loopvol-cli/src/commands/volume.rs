//! Volume commands for the loopvol CLI.

use anyhow::Result;
use colored::Colorize;
use loopvol_core::VolumeDriver;
use std::collections::HashMap;
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct VolumeRow {
    #[tabled(rename = "VOLUME NAME")]
    name: String,
    #[tabled(rename = "FS")]
    fs: String,
    #[tabled(rename = "SIZE")]
    size: String,
    #[tabled(rename = "ALLOCATED")]
    allocated: String,
    #[tabled(rename = "MOUNTPOINT")]
    mountpoint: String,
}

/// Create a volume
pub async fn create(
    driver: &VolumeDriver,
    name: &str,
    options: &HashMap<String, String>,
) -> Result<()> {
    driver.create(name, options).await?;
    println!("{} {}", "Created".green(), name);
    Ok(())
}

/// List all volumes
pub async fn ls(driver: &VolumeDriver) -> Result<()> {
    let volumes = driver.list().await?;

    if volumes.is_empty() {
        println!("No volumes found.");
        return Ok(());
    }

    let mut rows = Vec::with_capacity(volumes.len());
    for summary in volumes {
        let info = driver.get(&summary.name).await?;
        let status = |key: &str| info.status.get(key).cloned().unwrap_or_else(|| "-".to_string());
        rows.push(VolumeRow {
            fs: status("fs"),
            size: format_bytes(&status("size-max")),
            allocated: format_bytes(&status("size-allocated")),
            mountpoint: info.mountpoint,
            name: info.name,
        });
    }

    let mut table = Table::new(rows);
    table.with(Style::modern());

    println!("{}", table);

    Ok(())
}

/// Print a volume as JSON
pub async fn inspect(driver: &VolumeDriver, name: &str) -> Result<()> {
    let info = driver.get(name).await?;
    println!("{}", serde_json::to_string_pretty(&[info])?);
    Ok(())
}

/// Mount a volume for a consumer
pub async fn mount(driver: &VolumeDriver, name: &str, id: &str) -> Result<()> {
    let mount_point = driver.mount(name, id).await?;
    println!("{}", mount_point.display());
    Ok(())
}

/// Release a consumer's lease
pub async fn unmount(driver: &VolumeDriver, name: &str, id: &str) -> Result<()> {
    driver.unmount(name, id).await?;
    println!("{} {} ({})", "Released".yellow(), name, id);
    Ok(())
}

/// Remove a volume
pub async fn rm(driver: &VolumeDriver, name: &str) -> Result<()> {
    driver.remove(name).await?;
    println!("{}", name);
    Ok(())
}

fn format_bytes(raw: &str) -> String {
    match raw.parse::<u64>() {
        Ok(bytes) if bytes >= 1024 * 1024 * 1024 => {
            format!("{:.1}G", bytes as f64 / 1024.0 / 1024.0 / 1024.0)
        }
        Ok(bytes) => format!("{:.1}M", bytes as f64 / 1024.0 / 1024.0),
        Err(_) => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes("1073741824"), "1.0G");
        assert_eq!(format_bytes("20971520"), "20.0M");
        assert_eq!(format_bytes("-"), "-");
    }
}
