//! # rescat
//!
//! Walkthroughs of the resource catalog from the command line. Every
//! command builds an in-process catalog, serves it over the loopback
//! transport and talks to it through a client connection, the way a
//! controller would.
//!
//! ```text
//! rescat seed bootstrap.json      # seed from a document, print the result
//! rescat demo                     # create / update / conflict / list
//! rescat finalizers               # two-phase deletion
//! rescat watch --writes 10        # snapshot + live events, resume, overrun
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::*;
use futures::StreamExt;
use rescat_core::{EventType, Resource, ResourceId};
use rescat_sdk::wire::{
    CreateRequest, DeleteRequest, FinalizerRequest, GetRequest, ListRequest, ResourceMessage,
    UpdateRequest, WatchRequest, WatchResponse, WriteResponse,
};
use rescat_sdk::{
    bootstrap, catalog_span, init_logging, BootstrapDocument, Client, LocalService, LogFormat,
    MemoryTransport, ResourceService, SdkError,
};
use rescat_store::{Catalog, CatalogConfig};

// ─── CLI ───────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "rescat")]
#[command(about = "Versioned resource catalog walkthroughs")]
#[command(version)]
struct Cli {
    /// Log format: pretty, compact or json. Levels come from RUST_LOG.
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    /// Node name reported in response metadata
    #[arg(long, global = true, default_value = "localhost")]
    node: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seed a catalog from a bootstrap document and list what it holds
    Seed {
        /// Path to the JSON bootstrap document
        file: PathBuf,
        /// Print the listing as JSON wire messages
        #[arg(long)]
        json: bool,
    },
    /// Create, update, conflicting update and list
    Demo,
    /// Finalizer-gated deletion: tearing down, late finalizers, final removal
    Finalizers,
    /// Watch: initial snapshot, live events, resume after a version, overrun
    Watch {
        /// Number of live writes to make while watching
        #[arg(long, default_value_t = 5)]
        writes: usize,
    },
}

// ─── Pretty printing ──────────────────────────────────────────────────────

fn header(text: &str) {
    let bar = "═".repeat(60);
    println!("\n{}", bar.bright_cyan());
    println!("  {}", text.bold().bright_white());
    println!("{}", bar.bright_cyan());
}

fn section(text: &str) {
    println!("\n{} {}", "▸".bright_yellow(), text.bold());
}

fn step(text: &str) {
    println!("  {} {}", "•".bright_green(), text);
}

fn rejected(text: &str, err: &SdkError) {
    println!("  {} {} {}", "✗".bright_red(), text, format!("({err})").dimmed());
}

fn show_resource(message: &ResourceMessage) {
    let md = &message.metadata;
    let phase = if md.phase == "running" {
        md.phase.bright_green()
    } else {
        md.phase.bright_red()
    };
    let finalizers = if md.finalizers.is_empty() {
        "-".dimmed().to_string()
    } else {
        md.finalizers.join(",")
    };
    println!(
        "  {:<36} v{:<5} {:<12} {:<20} {}",
        format!("{}/{}/{}", md.namespace, md.resource_type, md.id).bright_magenta(),
        md.version,
        phase,
        finalizers,
        String::from_utf8_lossy(&message.spec.yaml).replace('\n', " ").dimmed()
    );
}

fn show_write(label: &str, reply: &WriteResponse) {
    step(&format!(
        "{label}: {} {}",
        format!("{:?}", reply.outcome).bright_cyan(),
        format!("@{}", reply.metadata.hostname).dimmed()
    ));
    if let Some(resource) = &reply.resource {
        show_resource(resource);
    }
}

fn show_event(event: &WatchResponse) {
    let kind = match event.event_type {
        EventType::Created => "CREATED".bright_green(),
        EventType::Updated => "UPDATED".bright_yellow(),
        EventType::Deleted => "DELETED".bright_red(),
    };
    print!("  {:<8}", kind);
    match &event.resource {
        Some(resource) => show_resource(resource),
        None => println!(),
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────

fn serve(catalog: Catalog) -> (MemoryTransport, Client) {
    let transport = MemoryTransport::new(LocalService::new(catalog));
    let client = transport.connect();
    (transport, client)
}

fn new_catalog(node: &str) -> Result<Catalog, SdkError> {
    Ok(Catalog::new(CatalogConfig::builder().node_name(node).build())?)
}

fn message(namespace: &str, resource_type: &str, id: &str, spec: &str) -> ResourceMessage {
    ResourceMessage::from(&Resource::new(ResourceId::new(namespace, resource_type, id), spec))
}

fn finalizer(id: &ResourceId, token: &str) -> FinalizerRequest {
    FinalizerRequest {
        namespace: id.namespace.clone(),
        resource_type: id.resource_type.clone(),
        id: id.id.clone(),
        finalizer: token.to_string(),
    }
}

fn delete_request(id: &ResourceId) -> DeleteRequest {
    DeleteRequest {
        namespace: id.namespace.clone(),
        resource_type: id.resource_type.clone(),
        id: id.id.clone(),
    }
}

fn version_of(reply: &WriteResponse) -> Result<String, SdkError> {
    reply
        .resource
        .as_ref()
        .map(|r| r.metadata.version.clone())
        .ok_or_else(|| SdkError::InvalidMessage("write reply without a resource".to_string()))
}

async fn list(client: &Client, namespace: &str, resource_type: &str) -> Result<(), SdkError> {
    let mut replies = client
        .list(ListRequest {
            namespace: namespace.to_string(),
            resource_type: resource_type.to_string(),
        })
        .await?;
    let mut count = 0;
    while let Some(reply) = replies.next().await {
        if let Some(resource) = reply?.resource {
            show_resource(&resource);
            count += 1;
        }
    }
    if count == 0 {
        println!("  {}", "(empty)".dimmed());
    }
    Ok(())
}

// ─── Seed ──────────────────────────────────────────────────────────────────

async fn run_seed(file: PathBuf, node: &str, json: bool) -> Result<(), SdkError> {
    header("SEED — Bootstrap a catalog from a document");

    let mut doc = BootstrapDocument::from_json_file(&file)?;
    if doc.catalog.node_name == CatalogConfig::default().node_name {
        doc.catalog.node_name = node.to_string();
    }
    let span = catalog_span("seed", &doc.catalog.node_name);
    let catalog = span.in_scope(|| bootstrap(&doc))?;
    step(&format!(
        "{} definitions, {} resources, catalog at version {}",
        doc.definitions.len(),
        catalog.len(),
        catalog.current_version()
    ));
    let (_transport, client) = serve(catalog.clone());

    let mut pairs: Vec<(String, String)> = doc
        .resources
        .iter()
        .map(|r| (r.namespace.clone(), r.resource_type.clone()))
        .collect();
    pairs.sort();
    pairs.dedup();

    for (namespace, resource_type) in pairs {
        section(&format!("{namespace}/{resource_type}"));
        if let Some(definition) = catalog.definition(&resource_type) {
            if !definition.aliases.is_empty() {
                step(&format!("aliases: {}", definition.aliases.join(", ")));
            }
        }
        if json {
            let mut replies = client
                .list(ListRequest {
                    namespace,
                    resource_type,
                })
                .await?;
            while let Some(reply) = replies.next().await {
                println!("{}", serde_json::to_string_pretty(&reply?)?);
            }
        } else {
            list(&client, &namespace, &resource_type).await?;
        }
    }
    Ok(())
}

// ─── Demo ──────────────────────────────────────────────────────────────────

async fn run_demo(node: &str) -> Result<(), SdkError> {
    header("DEMO — Versions and optimistic concurrency");
    let (_transport, client) = serve(new_catalog(node)?);

    section("Phase 1: Create");
    let created = client
        .create(CreateRequest {
            resource: message("config", "MachineConfigs", "v1alpha1", "machine: {type: init}"),
        })
        .await?;
    show_write("create", &created);
    let v1 = version_of(&created)?;

    match client
        .create(CreateRequest {
            resource: message("config", "MachineConfigs", "v1alpha1", "machine: {}"),
        })
        .await
    {
        Ok(_) => step("duplicate create unexpectedly succeeded"),
        Err(err) => rejected("second create of the same identity", &err),
    }

    section("Phase 2: Update with the observed version");
    let updated = client
        .update(UpdateRequest {
            resource: message("config", "MachineConfigs", "v1alpha1", "machine: {type: controlplane}"),
            expected_version: v1.clone(),
        })
        .await?;
    show_write("update", &updated);

    section("Phase 3: Update with a stale version");
    match client
        .update(UpdateRequest {
            resource: message("config", "MachineConfigs", "v1alpha1", "machine: {type: worker}"),
            expected_version: v1,
        })
        .await
    {
        Ok(_) => step("stale update unexpectedly succeeded"),
        Err(err) => rejected("stale update", &err),
    }

    section("Phase 4: Get and list");
    for id in ["b", "a"] {
        client
            .create(CreateRequest {
                resource: message("config", "MachineConfigs", id, "machine: {}"),
            })
            .await?;
    }
    let got = client
        .get(GetRequest {
            namespace: "config".into(),
            resource_type: "MachineConfigs".into(),
            id: "v1alpha1".into(),
        })
        .await?;
    if let Some(resource) = got.messages.first().and_then(|m| m.resource.as_ref()) {
        show_resource(resource);
    }
    step("list is ordered by id:");
    list(&client, "config", "MachineConfigs").await
}

// ─── Finalizers ────────────────────────────────────────────────────────────

async fn run_finalizers(node: &str) -> Result<(), SdkError> {
    header("FINALIZERS — Two-phase deletion");
    let (_transport, client) = serve(new_catalog(node)?);
    let id = ResourceId::new("network", "Links", "eth0");

    section("Phase 1: A resource guarded by a finalizer");
    let created = client
        .create(CreateRequest {
            resource: ResourceMessage::from(
                &Resource::new(id.clone(), "mtu: 1500").with_finalizers(["network-controller"]),
            ),
        })
        .await?;
    show_write("create", &created);

    section("Phase 2: Delete marks it tearing down");
    show_write("delete", &client.delete(delete_request(&id)).await?);
    show_write("delete again", &client.delete(delete_request(&id)).await?);

    section("Phase 3: Owners still attach and detach finalizers");
    show_write("add dhcp", &client.add_finalizer(finalizer(&id, "dhcp")).await?);
    show_write(
        "remove network-controller",
        &client.remove_finalizer(finalizer(&id, "network-controller")).await?,
    );

    section("Phase 4: The last finalizer goes, the resource goes");
    show_write("remove dhcp", &client.remove_finalizer(finalizer(&id, "dhcp")).await?);
    match client.delete(delete_request(&id)).await {
        Ok(_) => step("delete of a removed resource unexpectedly succeeded"),
        Err(err) => rejected("delete after removal", &err),
    }
    Ok(())
}

// ─── Watch ─────────────────────────────────────────────────────────────────

async fn next_event(
    events: &mut rescat_sdk::ReplyStream<WatchResponse>,
) -> Result<Option<WatchResponse>, SdkError> {
    match tokio::time::timeout(Duration::from_secs(2), events.next()).await {
        Ok(Some(event)) => event.map(Some),
        Ok(None) | Err(_) => Ok(None),
    }
}

async fn run_watch(node: &str, writes: usize) -> Result<(), SdkError> {
    header("WATCH — Snapshot, live tail, resume, overrun");
    let config = CatalogConfig::builder()
        .node_name(node)
        .event_log_retention(8)
        .subscriber_buffer(4)
        .build();
    let catalog = Catalog::new(config)?;
    let (transport, client) = serve(catalog.clone());

    section("Phase 1: Initial state arrives as CREATED events");
    for id in ["lo", "eth0"] {
        client
            .create(CreateRequest {
                resource: message("network", "Links", id, "up"),
            })
            .await?;
    }
    let mut events = client
        .watch(WatchRequest {
            namespace: Some("network".into()),
            resource_type: Some("Links".into()),
            resume_after: None,
        })
        .await?;
    for _ in 0..2 {
        if let Some(event) = next_event(&mut events).await? {
            show_event(&event);
        }
    }

    section(&format!("Phase 2: {writes} live writes from another connection"));
    let writer = transport.connect();
    let id = ResourceId::new("network", "Links", "eth0");
    let mut seen = catalog.current_version().to_string();
    for i in 0..writes {
        let current = catalog.get(&id)?;
        writer
            .update(UpdateRequest {
                resource: message("network", "Links", "eth0", &format!("mtu: {}", 1500 + i)),
                expected_version: current.version().to_string(),
            })
            .await?;
        if let Some(event) = next_event(&mut events).await? {
            show_event(&event);
            seen = event.resume_point()?.to_string();
        }
    }
    drop(events);

    section("Phase 3: Resume after the last seen version");
    writer.delete(delete_request(&ResourceId::new("network", "Links", "lo"))).await?;
    let mut resumed = client
        .watch(WatchRequest {
            namespace: Some("network".into()),
            resource_type: None,
            resume_after: Some(seen.clone()),
        })
        .await?;
    if let Some(event) = next_event(&mut resumed).await? {
        show_event(&event);
    }
    drop(resumed);

    for i in 0..12 {
        catalog.update(
            Resource::new(id.clone(), format!("mtu: {}", 9000 + i)),
            catalog.get(&id)?.version(),
        )?;
    }
    match client
        .watch(WatchRequest {
            namespace: Some("network".into()),
            resource_type: None,
            resume_after: Some(seen),
        })
        .await
    {
        Ok(_) => step("resume past the retained log unexpectedly succeeded"),
        Err(err) => rejected("resume after the log moved on", &err),
    }

    section("Phase 4: A watcher that stops reading is dropped");
    let mut slow = client.watch(WatchRequest::default()).await?;
    for i in 0..32 {
        catalog.update(
            Resource::new(id.clone(), format!("mtu: {}", 1400 - i)),
            catalog.get(&id)?.version(),
        )?;
    }
    let mut delivered = 0;
    loop {
        match next_event(&mut slow).await {
            Ok(Some(_)) => delivered += 1,
            Ok(None) => {
                step(&format!("stream ended after {delivered} events"));
                break;
            }
            Err(err) => {
                rejected(&format!("after {delivered} events"), &err);
                break;
            }
        }
    }

    let stats = catalog.stats();
    section("Catalog statistics");
    step(&format!(
        "version {} | {} resources | {} creates, {} updates, {} deletes | {} dropped watchers",
        stats.current_version,
        stats.resources,
        stats.creates,
        stats.updates,
        stats.deletes,
        stats.dropped_subscribers
    ));
    Ok(())
}

// ─── Entry point ───────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let result = match cli.command {
        Commands::Seed { file, json } => run_seed(file, &cli.node, json).await,
        Commands::Demo => run_demo(&cli.node).await,
        Commands::Finalizers => run_finalizers(&cli.node).await,
        Commands::Watch { writes } => run_watch(&cli.node, writes).await,
    };

    if let Err(err) = result {
        eprintln!("{} {}", "error:".bright_red().bold(), err);
        std::process::exit(1);
    }
}
