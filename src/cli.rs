use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "edge-dispatch")]
#[command(author)]
#[command(version)]
#[command(about = "Purchase-dispatch orchestrator for the edge bot fleet", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory (or single file) to load layered configuration from.
    #[arg(short, long, default_value = "config", global = true)]
    pub config: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Poll outstanding edge tasks and apply any terminal results.
    ProcessTasks,
    /// Run send_invitations then push_relations for both anticheat polarities.
    PushRelations {
        /// Also select "informed but unpaid" user requests (legacy toggle).
        #[arg(long)]
        informed: bool,
    },
    /// Run send_invitations alone, for both anticheat polarities.
    SendInvitations,
}
