use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn enroll(&self, name: &str, registration: &str, group: &str, subject: &str) -> zbus::Result<String>;
    async fn start_capture(&self) -> zbus::Result<()>;
    async fn cancel_capture(&self) -> zbus::Result<()>;
    async fn set_subject(&self, name: &str, subject: &str, group: &str) -> zbus::Result<()>;
    async fn cancel_subject(&self, name: &str) -> zbus::Result<()>;
    async fn pending_subjects(&self) -> zbus::Result<Vec<String>>;
    async fn roster(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn search_identities(&self, query: &str) -> zbus::Result<String>;
    async fn update_identity(
        &self,
        name: &str,
        new_name: &str,
        registration: &str,
        group: &str,
        subject: &str,
    ) -> zbus::Result<String>;
    async fn remove_identity(&self, name: &str) -> zbus::Result<bool>;
    async fn list_attendance(&self, date: &str, group: &str, subject: &str) -> zbus::Result<String>;
    async fn retrain(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "rollcall attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus (development mode)
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new person (interactive pose capture)
    Enroll {
        /// Unique display name
        #[arg(short, long, default_value = "")]
        name: String,
        #[arg(short, long, default_value = "")]
        registration: String,
        #[arg(short, long, default_value = "")]
        group: String,
        #[arg(short, long, default_value = "")]
        subject: String,
    },
    /// Control the running enrollment capture
    Capture {
        #[command(subcommand)]
        action: CaptureAction,
    },
    /// Answer a pending subject request
    Subject {
        name: String,
        subject: String,
        /// Override the enrolled group
        #[arg(short, long, default_value = "")]
        group: String,
    },
    /// Dismiss a pending subject request; it is raised again on the next sighting
    Dismiss { name: String },
    /// List people waiting for a subject
    Pending,
    /// Show configured groups and subjects
    Roster,
    /// Show daemon status
    Status,
    /// List enrolled people
    List,
    /// Search people by name or registration
    Search { query: String },
    /// Update a person's details; omitted fields are left unchanged
    Update {
        name: String,
        #[arg(long, default_value = "")]
        new_name: String,
        #[arg(long, default_value = "")]
        registration: String,
        #[arg(long, default_value = "")]
        group: String,
        #[arg(long, default_value = "")]
        subject: String,
    },
    /// Remove an enrolled person
    Remove {
        name: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Show attendance rows
    Records {
        /// Day as YYYY-MM-DD
        #[arg(long, default_value = "")]
        date: String,
        #[arg(long, default_value = "")]
        group: String,
        #[arg(long, default_value = "")]
        subject: String,
    },
    /// Retrain the classifier from the enrolled samples
    Retrain,
    /// List V4L2 capture devices (does not need the daemon)
    Devices,
}

#[derive(Subcommand)]
enum CaptureAction {
    /// Start sampling the current pose
    Start,
    /// Abort the enrollment
    Cancel,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Devices = cli.command {
        list_devices();
        return Ok(());
    }

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Enroll {
            name,
            registration,
            group,
            subject,
        } => enroll(&proxy, &name, &registration, &group, &subject).await?,
        Commands::Capture { action } => match action {
            CaptureAction::Start => proxy.start_capture().await?,
            CaptureAction::Cancel => proxy.cancel_capture().await?,
        },
        Commands::Subject { name, subject, group } => {
            proxy.set_subject(&name, &subject, &group).await?;
            println!("Subject for {name} set to {subject}");
        }
        Commands::Dismiss { name } => proxy.cancel_subject(&name).await?,
        Commands::Pending => {
            let pending = proxy.pending_subjects().await?;
            if pending.is_empty() {
                println!("Nobody is waiting for a subject");
            }
            for name in pending {
                println!("{name}");
            }
        }
        Commands::Roster => println!("{}", pretty(&proxy.roster().await?)?),
        Commands::Status => println!("{}", pretty(&proxy.status().await?)?),
        Commands::List => print_identities(&proxy.list_identities().await?)?,
        Commands::Search { query } => print_identities(&proxy.search_identities(&query).await?)?,
        Commands::Update {
            name,
            new_name,
            registration,
            group,
            subject,
        } => {
            let now = proxy
                .update_identity(&name, &new_name, &registration, &group, &subject)
                .await?;
            println!("Updated {now}");
        }
        Commands::Remove { name, yes } => {
            if !yes && !confirm(&format!("Remove '{name}'? (y/n): ")).await? {
                println!("Cancelled");
                return Ok(());
            }
            proxy.remove_identity(&name).await?;
            println!("Removed {name}");
        }
        Commands::Records { date, group, subject } => {
            print_records(&proxy.list_attendance(&date, &group, &subject).await?)?
        }
        Commands::Retrain => println!("{}", pretty(&proxy.retrain().await?)?),
        Commands::Devices => {}
    }

    Ok(())
}

fn list_devices() {
    let devices = rollcall_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in devices {
        println!("{:14} {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
}

fn pretty(json: &str) -> Result<String> {
    let value: Value = serde_json::from_str(json)?;
    Ok(serde_json::to_string_pretty(&value)?)
}

fn field<'a>(row: &'a Value, key: &str) -> &'a str {
    row.get(key).and_then(Value::as_str).unwrap_or("-")
}

fn print_identities(json: &str) -> Result<()> {
    let rows: Vec<Value> = serde_json::from_str(json)?;
    if rows.is_empty() {
        println!("No people enrolled");
        return Ok(());
    }
    println!("{:20} | {:12} | {:6} | {:15} | Angles", "Name", "Registration", "Group", "Subject");
    println!("{}", "-".repeat(76));
    for row in &rows {
        let angles = row
            .get("angles")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(","))
            .unwrap_or_default();
        println!(
            "{:20} | {:12} | {:6} | {:15} | {}",
            field(row, "name"),
            field(row, "registration"),
            field(row, "group"),
            field(row, "subject"),
            angles
        );
    }
    Ok(())
}

fn print_records(json: &str) -> Result<()> {
    let rows: Vec<Value> = serde_json::from_str(json)?;
    if rows.is_empty() {
        println!("No attendance rows");
        return Ok(());
    }
    println!(
        "{:10} | {:20} | {:12} | {:6} | {:10} | {:8} | {:8}",
        "Date", "Name", "Registration", "Group", "Subject", "Entry", "Exit"
    );
    println!("{}", "-".repeat(92));
    for row in &rows {
        println!(
            "{:10} | {:20} | {:12} | {:6} | {:10} | {:8} | {:8}",
            field(row, "date"),
            field(row, "person"),
            field(row, "registration"),
            field(row, "group"),
            field(row, "subject"),
            field(row, "entry"),
            field(row, "exit")
        );
    }
    Ok(())
}

async fn confirm(prompt: &str) -> Result<bool> {
    println!("{prompt}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let answer = lines.next_line().await?.unwrap_or_default();
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes" | "s" | "si"))
}

/// What a line typed during enrollment asks for.
#[derive(Debug, PartialEq, Eq)]
enum OperatorInput {
    Start,
    Cancel,
    /// stdin reached end of file.
    Closed,
}

fn operator_input(line: Option<&str>) -> OperatorInput {
    match line.map(str::trim) {
        None => OperatorInput::Closed,
        Some(l) if l.eq_ignore_ascii_case("q") => OperatorInput::Cancel,
        Some(_) => OperatorInput::Start,
    }
}

async fn is_enrolling(proxy: &AttendanceProxy<'_>) -> Result<bool> {
    let status: Value = serde_json::from_str(&proxy.status().await?)?;
    Ok(status.get("enrolling").and_then(Value::as_bool).unwrap_or(false))
}

/// Queue an enrollment, then relay Enter presses as capture starts until the
/// daemon reports the enrollment finished.
async fn enroll(
    proxy: &AttendanceProxy<'_>,
    name: &str,
    registration: &str,
    group: &str,
    subject: &str,
) -> Result<()> {
    let queued: Value = serde_json::from_str(&proxy.enroll(name, registration, group, subject).await?)?;
    let name = field(&queued, "name").to_string();
    println!(
        "Enrolling {name} (registration {}, group {}, subject {})",
        field(&queued, "registration"),
        field(&queued, "group"),
        field(&queued, "subject")
    );
    println!("Poses are captured in order: frontal, right, left.");
    println!("Press Enter to start each pose, or type q and Enter to cancel.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut poll = tokio::time::interval(Duration::from_millis(500));
    let mut cancelled = false;
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match operator_input(line?.as_deref()) {
                    OperatorInput::Start => {
                        if let Err(e) = proxy.start_capture().await {
                            tracing::debug!(error = %e, "start ignored");
                        }
                        println!("Capturing...");
                    }
                    OperatorInput::Cancel => {
                        if !cancelled {
                            proxy.cancel_capture().await?;
                            cancelled = true;
                        }
                    }
                    OperatorInput::Closed => {
                        stdin_open = false;
                        if !cancelled {
                            proxy.cancel_capture().await?;
                            cancelled = true;
                        }
                    }
                }
            }
            _ = poll.tick() => {
                if !is_enrolling(proxy).await? {
                    break;
                }
            }
        }
    }

    let stored: Vec<Value> = serde_json::from_str(&proxy.search_identities(&name).await?)?;
    if stored.iter().any(|row| field(row, "name") == name) {
        println!("Enrolled {name}");
        Ok(())
    } else if cancelled {
        println!("Enrollment cancelled");
        Ok(())
    } else {
        bail!("enrollment of {name} failed; see the rollcalld log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_input() {
        assert_eq!(operator_input(Some("")), OperatorInput::Start);
        assert_eq!(operator_input(Some("  go ")), OperatorInput::Start);
        assert_eq!(operator_input(Some(" q")), OperatorInput::Cancel);
        assert_eq!(operator_input(Some("Q")), OperatorInput::Cancel);
        assert_eq!(operator_input(None), OperatorInput::Closed);
    }

    #[test]
    fn test_cli_parses_enroll_and_records() {
        let cli = Cli::try_parse_from(["rollcall", "--session", "enroll", "-n", "Ana", "-g", "7P"]).unwrap();
        assert!(cli.session);
        assert!(matches!(cli.command, Commands::Enroll { ref name, ref group, .. } if name == "Ana" && group == "7P"));

        let cli = Cli::try_parse_from(["rollcall", "records", "--date", "2025-03-03"]).unwrap();
        assert!(matches!(cli.command, Commands::Records { ref date, .. } if date == "2025-03-03"));
    }
}
