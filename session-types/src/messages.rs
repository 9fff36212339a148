//! Frames exchanged between participants over a byte-stream channel.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{
    InvitationId, ReferencePointId, Role, SessionId, SessionPath, Timestamp, TransferId, UserId,
    WireError,
};

/// Every frame a participant can send to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Channel identification, first frame on a socket
    Hello(Hello),
    /// Invite a participant into a session
    Invitation(Invitation),
    /// Invitee accepted
    InvitationAccepted(InvitationAccepted),
    /// Invitee declined
    InvitationDeclined(InvitationDeclined),
    /// Session snapshot for a joiner (usually sent as a transfer)
    Welcome(Welcome),
    /// Sequenced activities, host to participants
    Activities(ActivityBatch),
    /// Unsequenced activities, participant to host
    Submit(ActivityBatch),
    /// Ask the host to resend a timestamp range
    RetransmitRequest(RetransmitRequest),
    /// A participant joined
    UserJoined(UserJoined),
    /// A participant left
    UserLeft(UserLeft),
    /// The receiver was removed by the host
    Kicked(Kicked),
    /// The sender is leaving, or the host dissolved the session
    SessionEnded(SessionEnded),
    /// One piece of a bulk transfer
    TransferChunk(TransferChunk),
    /// A bulk transfer was abandoned
    TransferCancelled(TransferCancelled),
}

impl PeerMessage {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec_named(self).map_err(WireError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(bytes).map_err(WireError::Deserialization)
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Hello(_) => "hello",
            PeerMessage::Invitation(_) => "invitation",
            PeerMessage::InvitationAccepted(_) => "invitation-accepted",
            PeerMessage::InvitationDeclined(_) => "invitation-declined",
            PeerMessage::Welcome(_) => "welcome",
            PeerMessage::Activities(_) => "activities",
            PeerMessage::Submit(_) => "submit",
            PeerMessage::RetransmitRequest(_) => "retransmit-request",
            PeerMessage::UserJoined(_) => "user-joined",
            PeerMessage::UserLeft(_) => "user-left",
            PeerMessage::Kicked(_) => "kicked",
            PeerMessage::SessionEnded(_) => "session-ended",
            PeerMessage::TransferChunk(_) => "transfer-chunk",
            PeerMessage::TransferCancelled(_) => "transfer-cancelled",
        }
    }
}

/// Identifies the sender of a freshly opened socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version (currently 1)
    pub version: u8,
    /// Sender address
    pub user: UserId,
}

/// A participant with its role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    /// Participant address
    pub user: UserId,
    /// Current role
    pub role: Role,
}

/// Metadata of a reference point offered in an invitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferencePointInfo {
    /// Session handle
    pub id: ReferencePointId,
    /// Display name
    pub name: String,
    /// Number of files below the root
    pub file_count: u64,
    /// Sum of file sizes
    pub total_bytes: u64,
}

/// Invitation into a running session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    /// Invitation handle, echoed in the answer
    pub invitation_id: InvitationId,
    /// Session being offered
    pub session_id: SessionId,
    /// Session host
    pub host: UserId,
    /// Participant who issued the invitation
    pub inviter: UserId,
    /// Participant being invited
    pub invitee: UserId,
    /// Free-form description
    pub description: String,
    /// Shared reference points
    pub reference_points: Vec<ReferencePointInfo>,
    /// Current participants
    pub participants: Vec<ParticipantInfo>,
}

/// Invitee agreed to join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationAccepted {
    /// Invitation being answered
    pub invitation_id: InvitationId,
    /// Session being joined
    pub session_id: SessionId,
}

/// Invitee refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationDeclined {
    /// Invitation being answered
    pub invitation_id: InvitationId,
    /// Why
    pub reason: String,
}

/// Full content of a reference point, as sent to a joiner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferencePointSnapshot {
    /// Session handle
    pub id: ReferencePointId,
    /// Display name
    pub name: String,
    /// Folders, parents before children
    pub folders: Vec<SessionPath>,
    /// Files and their content
    pub files: Vec<(SessionPath, Vec<u8>)>,
}

/// Everything a joiner needs to catch up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    /// Session joined
    pub session_id: SessionId,
    /// Session host
    pub host: UserId,
    /// All participants, joiner included, in join order
    pub participants: Vec<ParticipantInfo>,
    /// Reference point contents
    pub reference_points: Vec<ReferencePointSnapshot>,
    /// First timestamp not reflected in the snapshot
    pub next_timestamp: Timestamp,
}

/// An encoded [`Envelope`](crate::Envelope).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityBatch {
    /// Envelope bytes
    pub envelope: Vec<u8>,
}

/// Request to resend the inclusive range `from..=to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetransmitRequest {
    /// Session the range belongs to
    pub session_id: SessionId,
    /// First missing timestamp
    pub from: Timestamp,
    /// Last missing timestamp
    pub to: Timestamp,
}

/// Broadcast when someone joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserJoined {
    /// Session joined
    pub session_id: SessionId,
    /// The newcomer
    pub participant: ParticipantInfo,
}

/// Broadcast when someone left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLeft {
    /// Session left
    pub session_id: SessionId,
    /// Who left
    pub user: UserId,
    /// Why
    pub reason: StopReason,
}

/// Tells the receiver it was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kicked {
    /// Session the receiver was removed from
    pub session_id: SessionId,
}

/// Sender is leaving; from the host this dissolves the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEnded {
    /// Session ending
    pub session_id: SessionId,
    /// Why
    pub reason: StopReason,
}

/// One piece of a bulk transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferChunk {
    /// Transfer handle
    pub transfer_id: TransferId,
    /// Declared size of the whole payload
    pub total_size: u64,
    /// Byte offset of this chunk
    pub offset: u64,
    /// Chunk bytes
    pub data: Vec<u8>,
}

/// A bulk transfer was abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCancelled {
    /// Transfer handle
    pub transfer_id: TransferId,
}

/// Why a participant's session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    /// The local user left.
    LocalLeave,
    /// The host ended the session.
    HostDissolved,
    /// The host removed the local user.
    Kicked,
    /// The link to the session was lost.
    ConnectionLost,
    /// Local state became inconsistent.
    LocalError,
}

impl StopReason {
    /// Whether stopping for this reason sends a session-end notice.
    ///
    /// No notice goes out when the link is gone, or when the session was
    /// already ended by someone else.
    pub fn announces(&self) -> bool {
        matches!(self, StopReason::LocalLeave | StopReason::LocalError)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::LocalLeave => "local leave",
            StopReason::HostDissolved => "host dissolved",
            StopReason::Kicked => "kicked",
            StopReason::ConnectionLost => "connection lost",
            StopReason::LocalError => "local error",
        };
        f.write_str(text)
    }
}
