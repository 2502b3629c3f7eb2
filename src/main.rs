use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use jobfleet::config::{CoordinatorConfig, DiscoveryConfig};
use jobfleet::job::{JobRequirements, JobSpec};
use jobfleet::network::connection::MAX_LINE_LENGTH;
use jobfleet::network::transfer::{self, FileReceiver};
use jobfleet::node::{ensure_admin, Node};
use jobfleet::protocol::{Inbound, Outbound, EOF_MARKER};
use jobfleet::shutdown::install_shutdown_handler;
use jobfleet::store::{NewUser, SqliteStore, Store};

#[derive(Parser, Debug)]
#[command(name = "jobfleet")]
#[command(version)]
#[command(about = "Schedules compute jobs onto a pool of remote workstations")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the coordinator
    Start(StartArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// List connected workstations
    Workers {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// User management commands (administrators only)
    User {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: UserCommands,
    },

    /// Re-enqueue every job still waiting for a workstation
    Schedule {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Coordinator Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct StartArgs {
    /// Working directory for the database, logs and job files (created if missing)
    working_dir: PathBuf,

    /// Log at debug level
    #[arg(long, conflicts_with = "quiet")]
    debug: bool,

    /// Only log errors
    #[arg(long)]
    quiet: bool,

    /// Announce the coordinator on this multicast group (e.g. 228.0.0.5)
    #[arg(long)]
    multicast: Option<Ipv4Addr>,

    /// Port to listen on for workers and clients
    #[arg(long, default_value = "49999")]
    port: u16,

    /// UDP port of the discovery beacon
    #[arg(long, default_value = "50000")]
    discovery_port: u16,

    /// Port for the read-only web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Create this user as administrator if it does not exist yet
    #[arg(long)]
    admin: Option<String>,

    /// Interval between dispatch ticks in milliseconds
    #[arg(long, default_value = "15000")]
    tick_interval_ms: u64,
}

// =============================================================================
// Client Arguments (shared by every client command)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Coordinator address
    #[arg(long, short = 'a', default_value = "127.0.0.1:49999")]
    addr: SocketAddr,

    /// Email of the user issuing the request
    #[arg(long, short = 'u')]
    user: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a new job
    Submit {
        /// Job name
        #[arg(long)]
        name: String,

        /// Command the worker runs
        #[arg(long)]
        execute: String,

        /// Command run on the coordinator before dispatch
        #[arg(long)]
        compile: Option<String>,

        #[arg(long, default_value = "")]
        description: String,

        #[arg(long, default_value = "1")]
        min_cpu: u32,

        /// Minimum memory in KB
        #[arg(long, default_value = "0")]
        min_memory: u64,

        #[arg(long)]
        os: Option<String>,

        /// Required program (repeatable)
        #[arg(long = "program")]
        programs: Vec<String>,

        /// The job uses several CPUs
        #[arg(long)]
        multi_cpu: bool,

        /// Directory to upload as the job's files
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// List jobs
    List {
        /// Include archived jobs
        #[arg(long)]
        all: bool,

        /// Jobs of every user (administrators only)
        #[arg(long)]
        all_users: bool,
    },
    /// Show the log of a job
    Log { job_id: u64 },
    /// Kill a job
    Kill { job_id: u64 },
    /// Delete a job
    Delete { job_id: u64 },
    /// Archive a finished job
    Archive { job_id: u64 },
    /// Download the results of a finished job
    Results {
        job_id: u64,

        /// Directory to unpack the results into
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
}

#[derive(clap::Subcommand, Debug)]
enum UserCommands {
    /// Create a user
    Create {
        email: String,

        #[arg(long, default_value = "")]
        first_name: String,

        #[arg(long, default_value = "")]
        last_name: String,

        #[arg(long)]
        admin: bool,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    job_id: u64,
    uploaded_bytes: Option<u64>,
}

// =============================================================================
// Client Connection
// =============================================================================

/// One request/response exchange with the coordinator.
struct Client {
    lines: FramedRead<OwnedReadHalf, LinesCodec>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Result<Self, Box<dyn std::error::Error>> {
        let stream = TcpStream::connect(addr).await?;
        let (read, write) = stream.into_split();
        Ok(Self {
            lines: FramedRead::new(read, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            writer: BufWriter::new(write),
        })
    }

    async fn send(&mut self, request: &Inbound) -> Result<(), Box<dyn std::error::Error>> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn next_line(&mut self) -> Result<String, Box<dyn std::error::Error>> {
        match self.lines.next().await {
            Some(line) => Ok(line?),
            None => Err("connection closed by coordinator".into()),
        }
    }

    /// Read until the response, unpacking any file sent ahead of it into `out`.
    async fn response(&mut self, out: Option<&Path>) -> Result<Value, Box<dyn std::error::Error>> {
        let mut receiver: Option<FileReceiver> = None;
        loop {
            let line = self.next_line().await?;
            if line == EOF_MARKER {
                if let (Some(done), Some(out)) = (receiver.take(), out) {
                    let file = done.finish().await?;
                    if !file.verified {
                        tokio::fs::remove_file(&file.path).await?;
                        return Err("received file failed checksum verification".into());
                    }
                    let dest = out.join(file.header.job_id.to_string());
                    let archive = file.path.clone();
                    let unpack_dest = dest.clone();
                    tokio::task::spawn_blocking(move || jobfleet::archive::unpack(&archive, &unpack_dest))
                        .await??;
                    tokio::fs::remove_file(&file.path).await?;
                    eprintln!("Results unpacked into {}", dest.display());
                }
                continue;
            }

            match serde_json::from_str::<Outbound>(&line)? {
                Outbound::Put(header) => {
                    if let Some(out) = out {
                        receiver = Some(FileReceiver::create(out, header).await?);
                    }
                }
                Outbound::Chunk { data } => {
                    if let Some(receiver) = receiver.as_mut() {
                        receiver.push_chunk(&data).await?;
                    }
                }
                Outbound::Response {
                    result,
                    message,
                    data,
                    ..
                } => {
                    if !result {
                        return Err(message.unwrap_or_else(|| "request failed".to_string()).into());
                    }
                    return Ok(data.unwrap_or(Value::Null));
                }
                _ => {}
            }
        }
    }

    async fn request(&mut self, request: &Inbound) -> Result<Value, Box<dyn std::error::Error>> {
        self.send(request).await?;
        self.response(None).await
    }
}

async fn request(client_args: &ClientArgs, request: Inbound) -> Result<Value, Box<dyn std::error::Error>> {
    let mut client = Client::connect(client_args.addr).await?;
    client.request(&request).await
}

fn print_value(output: &OutputFormat, value: &Value) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Table => match value {
            Value::Null => println!("OK"),
            other => println!("{}", serde_json::to_string_pretty(other)?),
        },
    }
    Ok(())
}

fn text(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "-".to_string(),
        Some(other) => other.to_string(),
    }
}

// =============================================================================
// Coordinator Implementation
// =============================================================================

fn init_logging(args: &StartArgs, log_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let level = if args.debug {
        "debug"
    } else if args.quiet {
        "error"
    } else {
        "info"
    };
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(log_file)),
        )
        .init();
    Ok(())
}

async fn run_coordinator(args: StartArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let mut config = CoordinatorConfig::new(&args.working_dir, listen_addr)
        .with_tick_interval_ms(args.tick_interval_ms);
    if let Some(port) = args.dashboard_port {
        config = config.with_dashboard(format!("0.0.0.0:{}", port).parse()?);
    }
    if let Some(group) = args.multicast {
        config = config.with_discovery(DiscoveryConfig {
            group,
            port: args.discovery_port,
            ..DiscoveryConfig::default()
        });
    }

    std::fs::create_dir_all(&config.working_dir)?;
    init_logging(&args, &config.log_path())?;

    let store = Arc::new(SqliteStore::open(&config.db_path())?);
    if let Some(admin) = &args.admin {
        ensure_admin(store.as_ref(), admin)?;
    }

    tracing::info!(
        working_dir = %config.working_dir.display(),
        listen_addr = %config.listen_addr,
        dashboard_addr = ?config.dashboard_addr,
        multicast = ?args.multicast,
        "Starting jobfleet coordinator"
    );

    let cancel = install_shutdown_handler()?;
    let store: Arc<dyn Store> = store;
    let node = Node::bind(config, store, cancel).await?;
    node.run().await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_submit(
    client_args: &ClientArgs,
    spec: JobSpec,
    dir: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = Client::connect(client_args.addr).await?;
    let data = client
        .request(&Inbound::SubmitJob {
            username: client_args.user.clone(),
            job: spec,
            await_upload: dir.is_some(),
        })
        .await?;
    let job_id = data
        .get("jobId")
        .and_then(Value::as_u64)
        .ok_or("coordinator did not return a job id")?;

    let mut uploaded_bytes = None;
    if let Some(dir) = dir {
        let staging = tempfile_path(job_id);
        let (source, dest) = (dir.clone(), staging.clone());
        tokio::task::spawn_blocking(move || jobfleet::archive::pack(&dest, &source)).await??;
        let sent = transfer::send_file(&mut client.writer, job_id, &staging).await;
        let _ = tokio::fs::remove_file(&staging).await;
        uploaded_bytes = Some(sent?);
    }

    match client_args.output {
        OutputFormat::Json => {
            let output = JobSubmitOutput {
                job_id,
                uploaded_bytes,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {}", job_id);
            if let Some(bytes) = uploaded_bytes {
                println!("Uploaded: {} bytes", bytes);
            }
        }
    }
    Ok(())
}

fn tempfile_path(job_id: u64) -> PathBuf {
    std::env::temp_dir().join(format!("jobfleet-{}-{}.tar", job_id, std::process::id()))
}

async fn handle_job_list(
    client_args: &ClientArgs,
    all: bool,
    all_users: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = request(
        client_args,
        Inbound::GetJobs {
            username: client_args.user.clone(),
            show_all: all,
            all_users,
        },
    )
    .await?;

    match client_args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
        OutputFormat::Table => {
            let jobs = jobs.as_array().cloned().unwrap_or_default();
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!("{:<8} {:<28} {:<16} NAME", "JOB ID", "STATE", "WORKSTATION");
                println!("{}", "-".repeat(70));
                for job in &jobs {
                    println!(
                        "{:<8} {:<28} {:<16} {}",
                        text(job, "id"),
                        text(job, "state"),
                        text(job, "workstation"),
                        text(job, "name")
                    );
                }
                println!();
                println!("{} jobs", jobs.len());
            }
        }
    }
    Ok(())
}

async fn handle_job_results(
    client_args: &ClientArgs,
    job_id: u64,
    out: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    tokio::fs::create_dir_all(&out).await?;
    let mut client = Client::connect(client_args.addr).await?;
    client
        .send(&Inbound::GetResults {
            username: client_args.user.clone(),
            job_id,
        })
        .await?;
    let data = client.response(Some(&out)).await?;
    print_value(&client_args.output, &data)
}

async fn handle_workers(client_args: &ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let workers = request(
        client_args,
        Inbound::GetWorkstations {
            username: client_args.user.clone(),
        },
    )
    .await?;

    match client_args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&workers)?),
        OutputFormat::Table => {
            let workers = workers.as_array().cloned().unwrap_or_default();
            println!("{:<16} {:<10} {:<6} {:<10} {:<6} MAINTENANCE", "NAME", "OS", "CPUS", "MEMORY", "JOBS");
            println!("{}", "-".repeat(64));
            for worker in &workers {
                println!(
                    "{:<16} {:<10} {:<6} {:<10} {:<6} {}",
                    text(worker, "name"),
                    text(worker, "os"),
                    text(worker, "cpuCount"),
                    text(worker, "memory"),
                    text(worker, "activeJobs"),
                    text(worker, "maintenance")
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Start(start_args) => {
            run_coordinator(start_args).await?;
        }
        Commands::Job { client, command } => {
            let username = client.user.clone();
            match command {
                JobCommands::Submit {
                    name,
                    execute,
                    compile,
                    description,
                    min_cpu,
                    min_memory,
                    os,
                    programs,
                    multi_cpu,
                    dir,
                } => {
                    let spec = JobSpec {
                        name,
                        description,
                        requirements: JobRequirements {
                            min_cpu,
                            min_memory,
                            required_os: os,
                            required_programs: programs.into_iter().collect::<BTreeSet<_>>(),
                            multi_cpu,
                        },
                        compiler_command: compile,
                        execute_command: execute,
                    };
                    handle_job_submit(&client, spec, dir).await?;
                }
                JobCommands::List { all, all_users } => {
                    handle_job_list(&client, all, all_users).await?;
                }
                JobCommands::Log { job_id } => {
                    let log = request(&client, Inbound::GetLog { username, job_id }).await?;
                    match client.output {
                        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&log)?),
                        OutputFormat::Table => {
                            for line in log.as_array().cloned().unwrap_or_default() {
                                println!("{}", line.as_str().unwrap_or_default());
                            }
                        }
                    }
                }
                JobCommands::Kill { job_id } => {
                    let data = request(&client, Inbound::KillJob { username, job_id }).await?;
                    print_value(&client.output, &data)?;
                }
                JobCommands::Delete { job_id } => {
                    let data = request(&client, Inbound::DeleteJob { username, job_id }).await?;
                    print_value(&client.output, &data)?;
                }
                JobCommands::Archive { job_id } => {
                    let data = request(&client, Inbound::ArchiveJob { username, job_id }).await?;
                    print_value(&client.output, &data)?;
                }
                JobCommands::Results { job_id, out } => {
                    handle_job_results(&client, job_id, out).await?;
                }
            }
        }
        Commands::Workers { client } => {
            handle_workers(&client).await?;
        }
        Commands::User { client, command } => match command {
            UserCommands::Create {
                email,
                first_name,
                last_name,
                admin,
            } => {
                let user = NewUser {
                    email,
                    first_name,
                    last_name,
                    admin,
                };
                let data = request(
                    &client,
                    Inbound::CreateUser {
                        username: client.user.clone(),
                        user,
                    },
                )
                .await?;
                print_value(&client.output, &data)?;
            }
        },
        Commands::Schedule { client } => {
            let data = request(
                &client,
                Inbound::Schedule {
                    username: client.user.clone(),
                },
            )
            .await?;
            print_value(&client.output, &data)?;
        }
    }

    Ok(())
}
