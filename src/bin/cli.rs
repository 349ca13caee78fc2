// Attendance Server CLI
// Drives the attendance protocol as a student or teacher and validates server behaviour

use attendance_server::presence::protocol::{encode_frame, ClientMessage, ServerMessage};
use clap::{Parser, Subcommand};
use colored::*;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration};

const UPDATE_WAIT: Duration = Duration::from_secs(2);

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "attendance-cli")]
#[command(about = "Attendance Server CLI", long_about = None)]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:65432")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in as a student and run one countdown
    Student {
        #[arg(short, long)]
        username: String,

        /// Countdown length
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },

    /// Log in as a teacher and print roster updates until Ctrl+C
    Teacher {
        #[arg(short, long)]
        username: String,
    },

    /// Run validation scenarios against a running server
    Validate {
        /// Run one scenario instead of all of them
        #[arg(long)]
        scenario: Option<String>,
    },
}

struct AttendanceClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl AttendanceClient {
    async fn connect(server: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(server).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    async fn send(&mut self, message: &ClientMessage) -> CliResult<()> {
        let frame = encode_frame(message)?;
        self.writer.write_all(frame.as_bytes()).await?;
        Ok(())
    }

    async fn login(&mut self, username: &str, role: &str) -> CliResult<()> {
        self.send(&ClientMessage::Login {
            username: username.to_string(),
            role: role.to_string(),
        })
        .await
    }

    /// Next roster update, or `None` on timeout or disconnect
    async fn next_update(&mut self, wait: Duration) -> Option<(Vec<String>, Vec<String>)> {
        loop {
            let line = match timeout(wait, self.lines.next_line()).await {
                Ok(Ok(Some(line))) => line,
                _ => return None,
            };
            match serde_json::from_str::<ServerMessage>(&line) {
                Ok(ServerMessage::UpdateAttendance { data, active }) => return Some((data, active)),
                Err(e) => println!("{} Unexpected message {}: {}", "?".yellow(), line, e),
            }
        }
    }

    /// Reads updates until one satisfies `check`
    async fn wait_for<F>(&mut self, check: F) -> Option<(Vec<String>, Vec<String>)>
    where
        F: Fn(&[String], &[String]) -> bool,
    {
        while let Some((present, active)) = self.next_update(UPDATE_WAIT).await {
            if check(&present, &active) {
                return Some((present, active));
            }
        }
        None
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Student { username, seconds } => {
            run_student(&cli.server, username, *seconds).await;
        }
        Commands::Teacher { username } => {
            run_teacher(&cli.server, username).await;
        }
        Commands::Validate { scenario } => match scenario {
            Some(s) => {
                run_scenario(&cli.server, s).await;
            }
            None => run_all_validations(&cli.server).await,
        },
    }
}

fn print_update(present: &[String], active: &[String]) {
    println!(
        "  {} present: [{}]  running: [{}]",
        "▶".cyan(),
        present.join(", ").green(),
        active.join(", ").yellow()
    );
}

async fn run_student(server: &str, username: &str, seconds: u64) {
    println!("{}", "Connecting as student...".cyan());

    let mut client = match AttendanceClient::connect(server).await {
        Ok(client) => client,
        Err(e) => {
            println!("{} Cannot connect to server: {}", "✗".red(), e);
            println!("  Make sure the server is running on {}", server);
            return;
        }
    };

    if let Err(e) = student_countdown(&mut client, username, seconds).await {
        println!("{} Connection failed: {}", "✗".red(), e);
    }
}

async fn student_countdown(client: &mut AttendanceClient, username: &str, seconds: u64) -> CliResult<()> {
    client.login(username, "student").await?;
    client
        .send(&ClientMessage::StartTimer {
            username: username.to_string(),
        })
        .await?;
    println!("{} Timer started for {} ({}s)", "✓".green(), username.bold(), seconds);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
    while let Ok(Some((present, active))) =
        tokio::time::timeout_at(deadline, client.next_update(Duration::from_secs(seconds + 1)))
            .await
    {
        print_update(&present, &active);
    }

    client
        .send(&ClientMessage::StopTimer {
            username: username.to_string(),
        })
        .await?;
    println!("{} Timer stopped", "✓".green());

    if let Some((present, active)) = client.wait_for(|present, _| present.iter().any(|p| p == username)).await {
        print_update(&present, &active);
        println!("{} Marked present", "✓".green().bold());
    } else {
        println!("{} No confirmation received", "✗".red());
    }
    Ok(())
}

async fn run_teacher(server: &str, username: &str) {
    println!("{}", "Connecting as teacher...".cyan());

    let mut client = match AttendanceClient::connect(server).await {
        Ok(client) => client,
        Err(e) => {
            println!("{} Cannot connect to server: {}", "✗".red(), e);
            return;
        }
    };

    if let Err(e) = client.login(username, "teacher").await {
        println!("{} Login failed: {}", "✗".red(), e);
        return;
    }
    println!("{} Logged in as {}, press Ctrl+C to exit", "✓".green(), username.bold());

    loop {
        tokio::select! {
            line = client.lines.next_line() => match line {
                Ok(Some(line)) => match serde_json::from_str::<ServerMessage>(&line) {
                    Ok(ServerMessage::UpdateAttendance { data, active }) => print_update(&data, &active),
                    Err(_) => println!("  {}", line),
                },
                _ => {
                    println!("{} Server closed the connection", "✗".red());
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
}

fn list_scenarios() {
    println!("\n{}", "Available scenarios:".bold());
    println!("  single-student   login, start, stop; roster gains the student");
    println!("  disconnect       a student leaving mid-timer earns no attendance");
    println!("  invalid-role     login with an unknown role is refused");
}

async fn run_scenario(server: &str, scenario: &str) -> bool {
    println!("\n{} {}", "Running scenario:".bold(), scenario.cyan());
    println!("{}", "─".repeat(60));

    let result = match scenario {
        "single-student" => validate_single_student(server).await,
        "disconnect" => validate_disconnect(server).await,
        "invalid-role" => validate_invalid_role(server).await,
        _ => {
            println!("{} Unknown scenario: {}", "✗".red(), scenario);
            list_scenarios();
            return false;
        }
    };

    if result {
        println!("\n{} Scenario passed", "✓".green().bold());
    } else {
        println!("\n{} Scenario failed", "✗".red().bold());
    }
    result
}

async fn run_all_validations(server: &str) {
    println!("\n{}", "Running All Validation Tests".bold().green());
    println!("{}\n", "═".repeat(60).green());

    let mut passed = 0;
    let mut failed = 0;
    for scenario in ["single-student", "disconnect", "invalid-role"] {
        if run_scenario(server, scenario).await {
            passed += 1;
        } else {
            failed += 1;
        }
        sleep(Duration::from_millis(200)).await;
    }

    println!("\n{}", "═".repeat(60).green());
    println!("{}", "Validation Summary".bold());
    println!("{}", "═".repeat(60).green());
    println!("  {} Passed: {}", "✓".green(), passed.to_string().green());
    println!("  {} Failed: {}", "✗".red(), failed.to_string().red());

    if failed > 0 {
        println!("\n{}", "Some validations failed. Check output above.".yellow());
    }
}

/// Usernames unlikely to collide with real clients on a shared server
fn scenario_name(base: &str) -> String {
    format!("{}-{}", base, std::process::id())
}

async fn validate_single_student(server: &str) -> bool {
    let alice = scenario_name("alice");
    let mut client = match AttendanceClient::connect(server).await {
        Ok(client) => client,
        Err(e) => {
            println!("{} Connection failed: {}", "✗".red(), e);
            return false;
        }
    };

    report(single_student_steps(&mut client, &alice).await)
}

async fn single_student_steps(client: &mut AttendanceClient, alice: &String) -> CliResult<bool> {
    client.login(alice, "student").await?;
    if client.wait_for(|present, _| !present.contains(alice)).await.is_none() {
        println!("{} No roster after login", "✗".red());
        return Ok(false);
    }
    println!("{} Logged in", "✓".green());

    client.send(&ClientMessage::StartTimer { username: alice.clone() }).await?;
    if client
        .wait_for(|present, active| active.contains(alice) && !present.contains(alice))
        .await
        .is_none()
    {
        println!("{} Timer not reported as running", "✗".red());
        return Ok(false);
    }
    println!("{} Timer running, not yet present", "✓".green());

    client.send(&ClientMessage::StopTimer { username: alice.clone() }).await?;
    if client
        .wait_for(|present, active| present.contains(alice) && !active.contains(alice))
        .await
        .is_none()
    {
        println!("{} Student not marked present", "✗".red());
        return Ok(false);
    }
    println!("{} Marked present after stop", "✓".green());
    Ok(true)
}

async fn validate_disconnect(server: &str) -> bool {
    report(disconnect_steps(server).await)
}

async fn disconnect_steps(server: &str) -> CliResult<bool> {
    let alice = scenario_name("alice");
    let bob = scenario_name("bob");
    let mut alice_client = AttendanceClient::connect(server).await?;
    let mut bob_client = AttendanceClient::connect(server).await?;

    alice_client.login(&alice, "student").await?;
    bob_client.login(&bob, "student").await?;
    alice_client.send(&ClientMessage::StartTimer { username: alice.clone() }).await?;
    bob_client.send(&ClientMessage::StartTimer { username: bob.clone() }).await?;

    if bob_client
        .wait_for(|_, active| active.contains(&alice) && active.contains(&bob))
        .await
        .is_none()
    {
        println!("{} Both timers not reported as running", "✗".red());
        return Ok(false);
    }
    println!("{} Both timers running", "✓".green());

    drop(alice_client);
    if bob_client.wait_for(|_, active| !active.contains(&alice)).await.is_none() {
        println!("{} Disconnected student still running", "✗".red());
        return Ok(false);
    }
    println!("{} Disconnect discarded the running timer", "✓".green());

    bob_client.send(&ClientMessage::StopTimer { username: bob.clone() }).await?;
    match bob_client.wait_for(|present, _| present.contains(&bob)).await {
        Some((present, _)) if !present.contains(&alice) => {
            println!("{} Only the finishing student is present", "✓".green());
            Ok(true)
        }
        _ => {
            println!("{} Unexpected final roster", "✗".red());
            Ok(false)
        }
    }
}

async fn validate_invalid_role(server: &str) -> bool {
    report(invalid_role_steps(server).await)
}

async fn invalid_role_steps(server: &str) -> CliResult<bool> {
    let mut client = AttendanceClient::connect(server).await?;
    client.login(&scenario_name("mallory"), "admin").await?;

    // The server drops the connection without sending a roster
    match timeout(UPDATE_WAIT, client.lines.next_line()).await {
        Ok(Ok(None)) | Ok(Err(_)) => {
            println!("{} Connection refused for unknown role", "✓".green());
            Ok(true)
        }
        Ok(Ok(Some(line))) => {
            println!("{} Unexpected reply: {}", "✗".red(), line);
            Ok(false)
        }
        Err(_) => {
            println!("{} Connection left open", "✗".red());
            Ok(false)
        }
    }
}

fn report(result: CliResult<bool>) -> bool {
    result.unwrap_or_else(|e| {
        println!("{} {}", "✗".red(), e);
        false
    })
}
