use super::Parser;

#[derive(Parser, Debug)]
pub struct Cli {
    #[arg(long)]
    pub settings: Option<String>,

    /// Room to open once it shows up in the room list.
    #[arg(long)]
    pub activate: Option<String>,
}
