use clap::Parser;
use formdex::{
    Caller,
    Catalog,
    CatalogDb,
    DataDir,
    Error,
    FileRef,
    Form,
    FormPatch,
    NewForm,
    Result,
    SearchFilters,
    SearchRequest,
    Settings,
    mcp,
};
use kdam::{BarExt, tqdm};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, FormAction, SettingsAction};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("FORMDEX_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            Error::Config(format!("failed to start tokio runtime: {e}"))
        })?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let caller = cli.caller();

    // Settings are edited without opening the index or loading a model.
    if let Command::Settings { action } = cli.command {
        let db = CatalogDb::open(&data_dir.catalog_db())?;
        return cmd_settings(&db, action);
    }

    let catalog = Catalog::open(&data_dir)?;

    match cli.command {
        Command::Form { action } => match action {
            FormAction::Create(args) => {
                let input = NewForm {
                    title: args.title,
                    description: args.description,
                    category: args.category,
                    keywords: args.keywords,
                    business_areas: args.business_areas,
                    is_public: args.public,
                    effective_date: args.effective_date,
                };
                let form = catalog.create_form(input, &caller)?;
                print_form(&form, args.json)?;
            }
            FormAction::Update(args) => {
                let description = if args.clear_description {
                    Some(None)
                } else {
                    args.description.map(Some)
                };
                let patch = FormPatch {
                    title: args.title,
                    description,
                    category: args.category,
                    keywords: args.keywords,
                    business_areas: args.business_areas,
                    is_public: args.public,
                    effective_date: None,
                };
                let form = catalog.update_form(args.id, patch, &caller)?;
                print_form(&form, args.json)?;
            }
            FormAction::Delete { id } => {
                catalog.delete_form(id, &caller)?;
                println!("Deleted form {id}");
            }
            FormAction::Show { id, json } => {
                print_form(&catalog.get_form(id)?, json)?;
            }
        },
        Command::Transition(args) => {
            let event =
                catalog.transition(args.id, args.action, &caller, args.reason)?;
            let from = event.from.map(|s| s.as_str()).unwrap_or("-");
            println!("{} {from} -> {} ({})", args.id, event.to, event.action);
        }
        Command::Upload(args) => {
            let file = FileRef {
                key: args.key,
                file_name: args.file_name,
                file_size: args.size,
                file_type: args.file_type,
                change_notes: args.notes,
            };
            let record = catalog.record_version(args.id, file, &caller)?;
            println!(
                "Recorded version {} of form {}",
                record.version_number, args.id
            );
        }
        Command::Download(args) => {
            let download = catalog.record_download(args.id, &caller)?;
            if args.json {
                print_json(&download)?;
            } else {
                let file = &download.version.file;
                println!("{}\t{}", file.key, file.file_name);
            }
        }
        Command::Search(args) => {
            cmd_search(&catalog, &caller, args).await?;
        }
        Command::History(args) => {
            let history = catalog.history(args.id)?;
            if args.json {
                print_json(&history)?;
            } else {
                println!(
                    "Form {} is {} (version {})",
                    history.form_id, history.status, history.current_version
                );
                for event in &history.events {
                    let from = event.from.map(|s| s.as_str()).unwrap_or("-");
                    let reason = event.reason.as_deref().unwrap_or("");
                    println!(
                        "  {} {:<13} {from} -> {} by {} {reason}",
                        event.timestamp,
                        event.action.as_str(),
                        event.to,
                        event.actor
                    );
                }
                for version in &history.versions {
                    println!(
                        "  v{} {} by {}",
                        version.version_number,
                        version.file.file_name,
                        version.uploaded_by
                    );
                }
            }
        }
        Command::Audit(args) => {
            let audit = catalog.audit();
            let records = if let (Some(entity), Some(id)) =
                (args.entity, args.entity_id.as_deref())
            {
                audit.find_by_entity(entity, id)?
            } else if let Some(actor) = args.by.as_deref() {
                audit.find_by_actor(actor)?
            } else {
                audit.find_in_range(args.from, args.to.unwrap_or(u64::MAX))?
            };

            if args.json {
                print_json(&records)?;
            } else if records.is_empty() {
                println!("No audit records.");
            } else {
                for r in &records {
                    println!(
                        "{}\t{}\t{}\t{}/{}\t{}",
                        r.seq,
                        r.timestamp,
                        r.actor,
                        r.entity_type,
                        r.entity_id,
                        r.action
                    );
                }
            }
        }
        Command::Rebuild(args) => {
            if args.stale_embeddings {
                let queued = catalog.refresh_stale_embeddings()?;
                eprintln!("Queued {queued} embeddings");
            } else {
                let mut pb = tqdm!(desc = "Indexing", unit = " forms");
                let report = catalog.rebuild_index(|done, total| {
                    pb.total = total;
                    let _ = pb.update_to(done);
                })?;
                let _ = pb.refresh();
                eprintln!();
                eprintln!(
                    "Indexed {} of {} forms, {} queued for embedding",
                    report.indexed, report.forms, report.queued
                );
            }
        }
        Command::Status(args) => {
            let status = catalog.status()?;
            if args.json {
                print_json(&status)?;
            } else {
                println!("Data directory: {}", data_dir.root().display());
                println!("Embedder: {} ({})", status.embedder, status.model);
                println!("Forms: {}", status.stats.forms);
                println!("Versions: {}", status.stats.versions);
                println!("Workflow events: {}", status.stats.workflow_events);
                println!("Audit records: {}", status.stats.audit_records);
                println!("Downloads: {}", status.stats.downloads);
                println!("Indexed documents: {}", status.indexed_documents);
                println!(
                    "Embeddings: {} ({} failing)",
                    status.embeddings, status.failing_embeddings
                );
            }
        }
        Command::Mcp => {
            return mcp::serve(catalog, caller).await;
        }
        Command::Settings { .. } | Command::Completions(_) => {}
    }

    // Queued embedding refreshes would be lost when the process exits.
    catalog.flush_embeddings().await
}

async fn cmd_search(
    catalog: &Catalog,
    caller: &Caller,
    args: cli::SearchArgs,
) -> Result<()> {
    let request = SearchRequest {
        text: args.query,
        filters: SearchFilters {
            category: args.category,
            business_area: args.area,
            updated_from: args.updated_from,
            updated_to: args.updated_to,
            status: args.status,
            is_public: args.is_public,
        },
        sort: args.sort,
        direction: args.order,
        offset: args.offset,
        limit: args.count,
        published_only: args.published_only,
    };
    let page = catalog.search(&request, caller).await?;

    if args.json {
        return print_json(&page);
    }

    for notice in &page.notices {
        eprintln!("warning: {}", notice.message);
    }
    if page.items.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, hit) in page.items.iter().enumerate() {
        let stale = if hit.embedding_stale { " *" } else { "" };
        println!(
            "{:>3}. {:<6} {:.4}  {} [{}, {}]{stale}",
            page.offset + i + 1,
            hit.form_id.to_string(),
            hit.score,
            hit.title,
            hit.category,
            hit.status
        );
    }
    let partial = if page.partial { ", partial" } else { "" };
    println!(
        "\n{} of {} result(s){partial}",
        page.items.len(),
        page.total
    );
    Ok(())
}

fn cmd_settings(db: &CatalogDb, action: SettingsAction) -> Result<()> {
    match action {
        SettingsAction::Show { json } => {
            let settings = Settings::load(db)?;
            if json {
                print_json(&settings)?;
            } else {
                for key in Settings::KEYS {
                    println!("{key}\t{}", settings.get(key)?);
                }
            }
        }
        SettingsAction::Set { key, value } => {
            Settings::set(db, &key, &value)?;
            println!("Set {key} = {value}");
        }
        SettingsAction::Clear { key } => {
            if Settings::clear(db, &key)? {
                println!("Cleared {key}");
            } else {
                println!("{key} was not set");
            }
        }
    }
    Ok(())
}

fn print_form(form: &Form, json: bool) -> Result<()> {
    if json {
        return print_json(form);
    }
    println!("{} {}", form.id, form.title);
    println!("  status: {}", form.status);
    println!("  category: {}", form.category);
    if let Some(description) = &form.description {
        println!("  description: {description}");
    }
    if !form.keywords.is_empty() {
        println!("  keywords: {}", form.keywords.join(", "));
    }
    if !form.business_areas.is_empty() {
        println!("  business areas: {}", form.business_areas.join(", "));
    }
    println!("  public: {}", form.is_public);
    println!("  version: {}", form.current_version);
    println!("  updated: {}", form.updated_at);
    Ok(())
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
