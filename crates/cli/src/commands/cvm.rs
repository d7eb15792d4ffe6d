//! CVM Commands

use anyhow::Result;
use serde::Serialize;

use nexis_common::cvm::{format_disk, format_memory};
use nexis_common::deploy::{InstanceType, TeepodNode};
use nexis_common::{CloudClient, CvmAction, CvmDetail, CvmSummary, VisibilityUpdate};

use crate::output::{dash, print_item, print_json, print_list, print_success, status_label, OutputFormat, TableDisplay};

/// Row of `nexis list`
#[derive(Serialize)]
pub struct CvmRow {
    pub id: String,
    pub name: String,
    pub status: String,
    pub region: Option<String>,
    pub vcpu: Option<f64>,
    pub memory: Option<f64>,
    pub disk_size: Option<f64>,
}

impl From<CvmSummary> for CvmRow {
    fn from(cvm: CvmSummary) -> Self {
        Self {
            id: cvm.app_id.unwrap_or(cvm.id),
            name: cvm.name,
            status: cvm.status.to_string(),
            region: cvm.region,
            vcpu: cvm.vcpu,
            memory: cvm.memory,
            disk_size: cvm.disk_size,
        }
    }
}

impl TableDisplay for CvmRow {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "Status", "Region", "vCPU", "Memory", "Disk"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            status_label(&self.status),
            dash(self.region.as_deref()),
            dash(self.vcpu),
            format_memory(self.memory),
            format_disk(self.disk_size),
        ]
    }
}

/// `nexis show`
#[derive(Serialize)]
#[serde(transparent)]
pub struct CvmView(pub CvmDetail);

impl TableDisplay for CvmView {
    fn headers() -> Vec<&'static str> {
        vec!["App ID", "Name", "Status", "VM UUID", "Region", "vCPU", "Memory", "Disk", "Endpoints", "SSH"]
    }

    fn row(&self) -> Vec<String> {
        let cvm = &self.0;
        let endpoints = cvm
            .public_urls
            .iter()
            .map(|u| u.app.as_str())
            .filter(|u| !u.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        vec![
            cvm.app_id.clone(),
            dash(cvm.name.as_deref()),
            status_label(cvm.status.as_str()),
            dash(cvm.vm_uuid.as_deref()),
            dash(cvm.region.as_deref()),
            dash(cvm.vcpu),
            format_memory(cvm.memory),
            format_disk(cvm.disk_size),
            if endpoints.is_empty() { "-".to_string() } else { endpoints },
            dash(cvm.ssh().map(|s| s.command)),
        ]
    }
}

#[derive(Serialize)]
#[serde(transparent)]
pub struct NodeRow(pub TeepodNode);

impl TableDisplay for NodeRow {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "Region", "Free vCPU", "Free Memory", "Slots", "KMS", "Images"]
    }

    fn row(&self) -> Vec<String> {
        let node = &self.0;
        let images = node
            .images
            .iter()
            .flatten()
            .map(|i| i.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        vec![
            node.teepod_id.to_string(),
            dash(node.name.as_deref()),
            dash(node.region_identifier.as_deref()),
            dash(node.remaining_vcpu),
            format_memory(node.remaining_memory),
            dash(node.remaining_cvm_slots),
            if node.requires_onchain_kms() { "on-chain" } else { "built-in" }.to_string(),
            images,
        ]
    }
}

#[derive(Serialize)]
#[serde(transparent)]
pub struct InstanceTypeRow(pub InstanceType);

impl TableDisplay for InstanceTypeRow {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "Family", "vCPU", "Memory", "Disk", "Hourly", "GPU"]
    }

    fn row(&self) -> Vec<String> {
        let it = &self.0;
        vec![
            it.id.clone(),
            it.name.clone(),
            dash(it.family.as_deref()),
            dash(it.vcpu),
            format_memory(it.memory_mb.map(|m| m as f64)),
            dash(it.default_disk_size_gb.map(|d| format!("{d} GB"))),
            dash(it.hourly_rate.as_deref()),
            if it.requires_gpu.unwrap_or(false) { "yes" } else { "no" }.to_string(),
        ]
    }
}

pub async fn nodes(client: &CloudClient, format: OutputFormat) -> Result<()> {
    let nodes: Vec<NodeRow> = client.available_nodes().await?.into_iter().map(NodeRow).collect();
    print_list(&nodes, format);
    Ok(())
}

pub async fn instance_types(client: &CloudClient, format: OutputFormat) -> Result<()> {
    let types: Vec<InstanceTypeRow> = client.instance_types().await?.into_iter().map(InstanceTypeRow).collect();
    print_list(&types, format);
    Ok(())
}

pub async fn list(client: &CloudClient, page: u64, page_size: u64, format: OutputFormat) -> Result<()> {
    let result = client.list_cvms(page.max(1), page_size.clamp(1, 100)).await?;
    if format == OutputFormat::Json {
        print_json(&result);
        return Ok(());
    }
    let (total, page, pages) = (result.total, result.page, result.pages.max(1));
    let rows: Vec<CvmRow> = result.items.into_iter().map(CvmRow::from).collect();
    print_list(&rows, format);
    println!("Page {page} of {pages} · {total} total");
    Ok(())
}

pub async fn show(client: &CloudClient, id: &str, format: OutputFormat) -> Result<()> {
    let detail = client.get_cvm(id).await?;
    print_item(&CvmView(detail), format);
    Ok(())
}

pub async fn ssh(client: &CloudClient, id: &str, format: OutputFormat) -> Result<()> {
    let detail = client.get_cvm(id).await?;
    let Some(ssh) = detail.ssh() else {
        anyhow::bail!("{} has no gateway domain yet", detail.app_id);
    };
    match format {
        OutputFormat::Json => print_json(&ssh),
        OutputFormat::Table => println!("{}", ssh.command),
    }
    Ok(())
}

pub async fn action(client: &CloudClient, id: &str, action: CvmAction) -> Result<()> {
    client.cvm_action(id, action).await?;
    print_success(&format!("{} requested for {}", action.as_str(), id));
    Ok(())
}

/// Toggle public logs/sysinfo; unspecified flags keep their current value.
pub async fn visibility(
    client: &CloudClient,
    id: &str,
    public_logs: Option<bool>,
    public_sysinfo: Option<bool>,
    format: OutputFormat,
) -> Result<()> {
    let current = client.get_cvm(id).await?;
    let update = VisibilityUpdate {
        public_logs: public_logs.unwrap_or(current.public_logs),
        public_sysinfo: public_sysinfo.unwrap_or(current.public_sysinfo),
    };
    let response = client.update_visibility(id, &update).await?;
    match format {
        OutputFormat::Json => print_json(&response),
        OutputFormat::Table => print_success(&format!(
            "{}: public logs {}, public sysinfo {}",
            current.app_id,
            if update.public_logs { "on" } else { "off" },
            if update.public_sysinfo { "on" } else { "off" }
        )),
    }
    Ok(())
}

pub async fn delete(client: &CloudClient, id: &str) -> Result<()> {
    client.delete_cvm(id).await?;
    print_success(&format!("{} deleted", id));
    Ok(())
}
