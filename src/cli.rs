use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use formdex::{
    Caller,
    Capability,
    EntityType,
    FormId,
    Role,
    SortDirection,
    SortOrder,
    WorkflowAction,
    WorkflowStatus,
};

#[derive(Debug, Parser)]
#[command(
    name = "formdex",
    about = "A governed form catalog with hybrid keyword and semantic search"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Identity recorded as the actor of every change
    #[arg(long, global = true, default_value = "cli")]
    pub actor: String,

    /// Role the actor acts under (public, staff, admin)
    #[arg(long, global = true, default_value = "admin")]
    pub role: Role,

    /// Grant an extra capability (can be repeated)
    #[arg(long = "capability", global = true)]
    pub capabilities: Vec<Capability>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// The caller described by the global flags. Roles keep their default
    /// capabilities; `--capability` adds to them.
    pub fn caller(&self) -> Caller {
        if self.role == Role::Public {
            return Caller::public();
        }
        let capabilities = self
            .role
            .default_capabilities()
            .into_iter()
            .chain(self.capabilities.iter().copied());
        Caller::new(&self.actor, self.role, capabilities)
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create, edit, delete and inspect forms
    Form {
        #[command(subcommand)]
        action: FormAction,
    },
    /// Move a form through the review workflow
    Transition(TransitionArgs),
    /// Record a new file version for a form
    Upload(UploadArgs),
    /// Fetch the current file of a form and count the download
    Download(DownloadArgs),
    /// Search forms visible to the caller
    Search(SearchArgs),
    /// Show the workflow and version history of a form
    History(HistoryArgs),
    /// Query the audit trail
    Audit(AuditArgs),
    /// Rebuild the search index from the catalog
    Rebuild(RebuildArgs),
    /// Show catalog status and statistics
    Status(StatusArgs),
    /// Inspect and change runtime settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Start MCP server for AI agent integration
    Mcp,
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Forms --

#[derive(Debug, Subcommand)]
pub enum FormAction {
    /// Create a draft form
    Create(FormCreateArgs),
    /// Edit the metadata of a draft form
    Update(FormUpdateArgs),
    /// Soft-delete a form
    Delete {
        /// Form id (e.g. 12 or #12)
        id: FormId,
    },
    /// Show a form
    Show {
        /// Form id (e.g. 12 or #12)
        id: FormId,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Parser)]
pub struct FormCreateArgs {
    /// Form title
    pub title: String,

    /// Category the form belongs to
    #[arg(short = 'c', long)]
    pub category: String,

    /// Free-text description
    #[arg(short = 'd', long)]
    pub description: Option<String>,

    /// Search keyword (can be repeated)
    #[arg(short = 'k', long = "keyword")]
    pub keywords: Vec<String>,

    /// Business area (can be repeated)
    #[arg(short = 'a', long = "area")]
    pub business_areas: Vec<String>,

    /// Make the form visible to the public once published
    #[arg(long)]
    pub public: bool,

    /// Effective date in milliseconds since the Unix epoch
    #[arg(long)]
    pub effective_date: Option<u64>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct FormUpdateArgs {
    /// Form id (e.g. 12 or #12)
    pub id: FormId,

    #[arg(long)]
    pub title: Option<String>,

    #[arg(short = 'c', long)]
    pub category: Option<String>,

    #[arg(short = 'd', long)]
    pub description: Option<String>,

    /// Remove the description
    #[arg(long, conflicts_with = "description")]
    pub clear_description: bool,

    /// Replace the keywords (can be repeated)
    #[arg(short = 'k', long = "keyword")]
    pub keywords: Option<Vec<String>>,

    /// Replace the business areas (can be repeated)
    #[arg(short = 'a', long = "area")]
    pub business_areas: Option<Vec<String>>,

    /// Change public visibility
    #[arg(long)]
    pub public: Option<bool>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Workflow --

#[derive(Debug, Parser)]
pub struct TransitionArgs {
    /// Form id (e.g. 12 or #12)
    pub id: FormId,

    /// submit_review, approve, reject, publish, unpublish, archive, restore
    pub action: WorkflowAction,

    /// Reason recorded with the event
    #[arg(short = 'r', long)]
    pub reason: Option<String>,
}

#[derive(Debug, Parser)]
pub struct UploadArgs {
    /// Form id (e.g. 12 or #12)
    pub id: FormId,

    /// Storage key of the uploaded file
    #[arg(long)]
    pub key: String,

    /// Original file name
    #[arg(long)]
    pub file_name: String,

    /// File size in bytes
    #[arg(long, default_value = "0")]
    pub size: u64,

    /// MIME type
    #[arg(long = "type", default_value = "application/pdf")]
    pub file_type: String,

    /// What changed in this version
    #[arg(long)]
    pub notes: Option<String>,
}

#[derive(Debug, Parser)]
pub struct DownloadArgs {
    /// Form id (e.g. 12 or #12)
    pub id: FormId,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query; omit to browse
    #[arg(default_value = "")]
    pub query: String,

    /// Number of results to return
    #[arg(short = 'n', long, default_value = "0")]
    pub count: usize,

    /// Skip this many results
    #[arg(long, default_value = "0")]
    pub offset: usize,

    /// relevance, date, created, title or downloads
    #[arg(short = 's', long, default_value = "relevance")]
    pub sort: SortOrder,

    /// asc or desc; defaults to A to Z for title, newest or most first
    /// otherwise
    #[arg(long)]
    pub order: Option<SortDirection>,

    /// Only forms in this category
    #[arg(short = 'c', long)]
    pub category: Option<String>,

    /// Only forms tagged with this business area
    #[arg(short = 'a', long)]
    pub area: Option<String>,

    /// Updated at or after (ms since the Unix epoch)
    #[arg(long)]
    pub updated_from: Option<u64>,

    /// Updated at or before (ms since the Unix epoch)
    #[arg(long)]
    pub updated_to: Option<u64>,

    /// Only forms in this workflow status (e.g. pending_review)
    #[arg(long)]
    pub status: Option<WorkflowStatus>,

    /// Only public (true) or internal (false) forms
    #[arg(long = "public")]
    pub is_public: Option<bool>,

    /// Show only published forms, even to admins
    #[arg(long)]
    pub published_only: bool,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- History & audit --

#[derive(Debug, Parser)]
pub struct HistoryArgs {
    /// Form id (e.g. 12 or #12)
    pub id: FormId,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct AuditArgs {
    /// Entity type: forms or form_versions
    #[arg(long, requires = "entity_id")]
    pub entity: Option<EntityType>,

    /// Entity id, e.g. 12 or 12/v3
    #[arg(long = "id", requires = "entity")]
    pub entity_id: Option<String>,

    /// Records written by this actor
    #[arg(long = "by", conflicts_with = "entity")]
    pub by: Option<String>,

    /// Records at or after this time (ms since the Unix epoch)
    #[arg(long, default_value = "0")]
    pub from: u64,

    /// Records at or before this time (ms since the Unix epoch)
    #[arg(long)]
    pub to: Option<u64>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Maintenance --

#[derive(Debug, Parser)]
pub struct RebuildArgs {
    /// Only queue forms whose embedding is missing or outdated
    #[arg(long)]
    pub stale_embeddings: bool,
}

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum SettingsAction {
    /// Show every setting with its effective value
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Persist a setting in the catalog
    Set { key: String, value: String },
    /// Remove a persisted setting (revert to default)
    Clear { key: String },
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "formdex",
            &mut std::io::stdout(),
        );
    }
}
