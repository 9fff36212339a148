//! In-process multi-peer simulation.
//!
//! Every participant runs its own session actor with a private in-memory
//! file system, all wired together through one [`MemoryNetwork`]. The host
//! shares a folder holding one empty text file, every other participant
//! joins, and then all of them insert lines into that file at the same
//! time. The run converges when every replica ends up byte-identical and
//! holds every accepted edit.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use session_client::{
    spawn, ClientConfig, HostFileSystem, LocalReferencePoint, MemoryFileSystem, MemoryNetwork,
    SessionEvent, SessionHandle, SessionOptions, Subscription,
};
use session_types::{ActivityKind, ReferencePointId, ResourcePath, Role, SessionPath, UserId};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// File every participant edits.
const SHARED_FILE: &str = "notes.txt";

/// Poll interval while waiting on replicas.
const POLL: Duration = Duration::from_millis(20);

/// How long a single join step may take.
const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Participants, host included.
    pub participants: usize,
    /// Edits per participant.
    pub edits: u32,
    /// Keep the last participant read-only.
    pub observer: bool,
    /// Convergence deadline.
    pub timeout: Duration,
}

/// Outcome of a simulation run.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    /// Participants, host included.
    pub participants: usize,
    /// Participants allowed to edit, host included.
    pub drivers: usize,
    /// Read-only participants.
    pub observers: usize,
    /// Edits each participant attempted.
    pub edits_per_participant: u32,
    /// Edits the local actor accepted.
    pub edits_accepted: u64,
    /// Edits the local actor refused.
    pub edits_refused: u64,
    /// Size the shared file must reach.
    pub expected_bytes: u64,
    /// Whether every replica matched.
    pub converged: bool,
    /// Wall time from the first edit until quiescence (or the deadline).
    pub elapsed_ms: u64,
    /// Final state of each replica.
    pub replicas: Vec<ReplicaReport>,
}

/// Final state of one replica.
#[derive(Debug, Serialize)]
pub struct ReplicaReport {
    /// Participant.
    pub user: String,
    /// Role at the end of the run.
    pub role: Role,
    /// Size of the shared file.
    pub bytes: u64,
    /// Whether the shared file matches the host's copy.
    pub matches_host: bool,
}

impl SimulationReport {
    /// Print the report to stdout.
    pub fn print(&self, json: bool) -> Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(self)?);
            return Ok(());
        }

        println!("=== duet simulate ===");
        println!();
        println!(
            "Participants: {} ({} driving, {} observing)",
            self.participants, self.drivers, self.observers
        );
        println!(
            "Edits:        {} accepted, {} refused ({} per participant)",
            self.edits_accepted, self.edits_refused, self.edits_per_participant
        );
        println!();
        for replica in &self.replicas {
            let mark = if replica.matches_host { "ok" } else { "DIVERGED" };
            println!(
                "  {:<32} {:<8} {:>8} bytes  {}",
                replica.user, replica.role, replica.bytes, mark
            );
        }
        println!();
        if self.converged {
            println!("Converged in {} ms", self.elapsed_ms);
        } else {
            println!(
                "NOT converged after {} ms (expected {} bytes)",
                self.elapsed_ms, self.expected_bytes
            );
        }
        Ok(())
    }
}

struct Replica {
    label: String,
    id: UserId,
    handle: SessionHandle,
    fs: MemoryFileSystem,
    events: Subscription,
    role: Role,
    file: PathBuf,
}

impl Replica {
    fn spawn(net: &MemoryNetwork, config: &ClientConfig, label: &str) -> Result<Self> {
        let id = UserId::parse(format!("{label}@duet.local/sim"))
            .with_context(|| format!("Invalid participant name '{label}'"))?;
        let inbox = net.join(id.clone());
        let fs = MemoryFileSystem::new();
        let options = SessionOptions::new(
            id.clone(),
            net.connectors(&id, &config.transport.channels),
            inbox,
            Arc::new(fs.clone()),
        )
        .with_config(config.clone());
        let handle = spawn(options);
        let events = handle.subscribe();
        Ok(Self {
            label: label.to_string(),
            id,
            handle,
            fs,
            events,
            role: Role::Observer,
            file: PathBuf::new(),
        })
    }

    fn content(&self) -> Vec<u8> {
        self.fs.read(&self.file).unwrap_or_default()
    }
}

/// Run a simulation.
pub async fn run(config: ClientConfig, options: SimulationOptions) -> Result<SimulationReport> {
    if options.participants == 0 {
        bail!("A session needs at least one participant");
    }
    if options.observer && options.participants < 2 {
        bail!("--observer needs at least two participants");
    }

    let net = MemoryNetwork::new();
    let mut replicas = Vec::with_capacity(options.participants);
    replicas.push(Replica::spawn(&net, &config, "host")?);
    for n in 1..options.participants {
        replicas.push(Replica::spawn(&net, &config, &format!("peer{n}"))?);
    }

    let reference_point = start(&mut replicas[0]).await?;
    let (host, guests) = replicas.split_at_mut(1);
    let host = &host[0];
    let last = guests.len().saturating_sub(1);
    for (n, guest) in guests.iter_mut().enumerate() {
        let driver = !(options.observer && n == last);
        join(host, guest, driver).await?;
    }
    tracing::info!(
        participants = replicas.len(),
        "All participants joined, starting edits"
    );

    let started = Instant::now();
    let (accepted, refused, expected_bytes) =
        edit_concurrently(&replicas, reference_point, options.edits).await?;
    let converged = wait_for_quiescence(&replicas, expected_bytes, options.timeout).await;
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let host_copy = replicas[0].content();
    let report = SimulationReport {
        participants: replicas.len(),
        drivers: replicas.iter().filter(|r| r.role.has_write_access()).count(),
        observers: replicas.iter().filter(|r| !r.role.has_write_access()).count(),
        edits_per_participant: options.edits,
        edits_accepted: accepted,
        edits_refused: refused,
        expected_bytes,
        converged,
        elapsed_ms,
        replicas: replicas
            .iter()
            .map(|r| {
                let content = r.content();
                ReplicaReport {
                    user: r.id.to_string(),
                    role: r.role,
                    bytes: content.len() as u64,
                    matches_host: content == host_copy,
                }
            })
            .collect(),
    };

    for replica in replicas.iter().rev() {
        if let Err(e) = replica.handle.shutdown().await {
            tracing::warn!(user = %replica.id, error = %e, "Shutdown failed");
        }
    }
    Ok(report)
}

/// Seed the host folder and start the session.
async fn start(host: &mut Replica) -> Result<ReferencePointId> {
    let root = PathBuf::from(format!("/{}/proj", host.label));
    host.fs.create_folder(&root)?;
    host.fs.write(&root.join(SHARED_FILE), b"")?;
    host.handle
        .start_session(vec![LocalReferencePoint::new("proj", &root)])
        .await
        .context("Failed to start the session")?;
    host.role = Role::Host;
    host.file = root.join(SHARED_FILE);

    let status = host.handle.status().await?;
    let (id, _, _) = status
        .reference_points
        .first()
        .context("Session started without a reference point")?;
    Ok(*id)
}

/// Invite `guest`, accept on its behalf and optionally promote it.
async fn join(host: &Replica, guest: &mut Replica, driver: bool) -> Result<()> {
    host.handle
        .invite(vec![guest.id.clone()], "simulation")
        .await
        .with_context(|| format!("Failed to invite {}", guest.id))?;

    let invitation = tokio::time::timeout(STEP_TIMEOUT, async {
        while let Some(event) = guest.events.recv().await {
            if let SessionEvent::InvitationReceived(invitation) = event {
                return Some(invitation);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
    .with_context(|| format!("{} never received its invitation", guest.id))?;

    let workspace = PathBuf::from(format!("/{}/ws", guest.label));
    guest
        .handle
        .accept_invitation_into(invitation.invitation_id, workspace)
        .await
        .with_context(|| format!("{} failed to join", guest.id))?;

    let status = guest.handle.status().await?;
    let (_, _, root) = status
        .reference_points
        .first()
        .context("Joined session has no reference point")?;
    guest.file = root.join(SHARED_FILE);

    if driver {
        host.handle.change_role(guest.id.clone(), Role::Driver).await?;
        wait_for_role(guest, Role::Driver).await?;
        guest.role = Role::Driver;
    }
    tracing::debug!(user = %guest.id, role = %guest.role, "Participant joined");
    Ok(())
}

async fn wait_for_role(replica: &Replica, role: Role) -> Result<()> {
    let deadline = Instant::now() + STEP_TIMEOUT;
    loop {
        if replica.handle.role(&replica.id).await? == Some(role) {
            return Ok(());
        }
        if Instant::now() > deadline {
            bail!("{} never became {role}", replica.id);
        }
        tokio::time::sleep(POLL).await;
    }
}

/// Every participant inserts its lines at the top of the shared file.
///
/// Returns accepted and refused edit counts and the byte length the file
/// must reach.
async fn edit_concurrently(
    replicas: &[Replica],
    reference_point: ReferencePointId,
    edits: u32,
) -> Result<(u64, u64, u64)> {
    let path = ResourcePath::new(reference_point, SessionPath::parse(SHARED_FILE)?);

    let mut tasks = Vec::with_capacity(replicas.len());
    for replica in replicas {
        let handle = replica.handle.clone();
        let label = replica.label.clone();
        let path = path.clone();
        tasks.push(tokio::spawn(async move {
            let mut accepted = 0u64;
            let mut refused = 0u64;
            let mut bytes = 0u64;
            for n in 0..edits {
                let text = format!("{label}:{n}\n");
                let len = text.len() as u64;
                let kind = ActivityKind::TextEdit {
                    path: path.clone(),
                    offset: 0,
                    replaced_len: 0,
                    text,
                };
                match handle.record(kind).await {
                    Ok(()) => {
                        accepted += 1;
                        bytes += len;
                    }
                    Err(e) => {
                        tracing::debug!(user = %label, error = %e, "Edit refused");
                        refused += 1;
                    }
                }
                tokio::task::yield_now().await;
            }
            (accepted, refused, bytes)
        }));
    }

    let mut totals = (0, 0, 0);
    for task in tasks {
        let (accepted, refused, bytes) = task.await.context("Edit task panicked")?;
        totals.0 += accepted;
        totals.1 += refused;
        totals.2 += bytes;
    }
    Ok(totals)
}

/// Poll until every replica holds the same, complete file or `timeout` passes.
async fn wait_for_quiescence(replicas: &[Replica], expected_bytes: u64, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if replicas_agree(replicas, expected_bytes) {
            return true;
        }
        if Instant::now() > deadline {
            tracing::warn!(expected_bytes, "Replicas did not converge before the deadline");
            return false;
        }
        tokio::time::sleep(POLL).await;
    }
}

fn replicas_agree(replicas: &[Replica], expected_bytes: u64) -> bool {
    let Some((first, rest)) = replicas.split_first() else {
        return true;
    };
    let reference = first.content();
    reference.len() as u64 == expected_bytes && rest.iter().all(|r| r.content() == reference)
}
