//! The packet structures exchanged over the wire. This is the complete
//! vocabulary of the lobby protocol; in-game traffic reuses the same frame
//! format with its own payloads.

use serde::{Deserialize, Serialize};

/// Error codes transported in [`ErrorData`]. Every terminal rejection of a
/// session carries exactly one of these before the socket is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The client speaks a different major protocol version.
    VersionNotSupported,
    /// Wrong server password, or wrong game password on a join request.
    InvalidPassword,
    /// The requested player name violates the naming rules.
    InvalidPlayerName,
    /// Another connected player already uses that name.
    PlayerNameInUse,
    /// The session limit of the server is reached.
    ServerFull,
    /// A join request named a game id that does not exist.
    UnknownGame,
    /// The packet is not legal in the current session state.
    InvalidState,
}

impl ErrorCode {
    /// Stable numeric form of the code, for logs and callbacks.
    pub const fn as_u16(self) -> u16 {
        match self {
            ErrorCode::VersionNotSupported => 1,
            ErrorCode::InvalidPassword => 2,
            ErrorCode::InvalidPlayerName => 3,
            ErrorCode::PlayerNameInUse => 4,
            ErrorCode::ServerFull => 5,
            ErrorCode::UnknownGame => 6,
            ErrorCode::InvalidState => 7,
        }
    }
}

/// What kind of participant a player is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerType {
    Human,
    Computer,
}

/// Lifecycle stage of a game as announced in the game list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameListMode {
    Created,
    Started,
    Closed,
}

/// Opaque game configuration. The lobby hands this through to clients and
/// game tables without interpreting it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameData(pub Vec<u8>);

/// First packet of every session: the handshake request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitData {
    pub version_major: u16,
    pub version_minor: u16,
    /// Must match the server password. Empty on open servers.
    pub password: String,
    pub player_name: String,
}

/// Handshake confirmation. The session id is reserved for a future
/// reconnect path and currently unused by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitAckData {
    pub session_id: u32,
    pub player_id: u32,
}

/// Request for the public data of a player, by unique id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievePlayerInfoData {
    pub player_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerInfoData {
    pub player_id: u32,
    pub player_name: String,
    pub player_type: PlayerType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub error_code: ErrorCode,
}

/// Request to open a new game. The creator becomes its first player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateGameData {
    pub game_name: String,
    /// Password other players have to present on join. Empty = open game.
    pub password: String,
    pub game_data: GameData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinGameData {
    pub game_id: u32,
    pub password: String,
}

/// Public description of a game as shown in the lobby game list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameInfo {
    pub mode: GameListMode,
    pub name: String,
    pub data: GameData,
    pub players: Vec<u32>,
}

/// A game appeared in the directory. Sent for every existing game right
/// after the handshake, and broadcast when a new game is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameListNewData {
    pub game_id: u32,
    pub game_info: GameInfo,
}

/// A game changed its lifecycle stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameListUpdateData {
    pub game_id: u32,
    pub mode: GameListMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameListPlayerJoinedData {
    pub game_id: u32,
    pub player_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameListPlayerLeftData {
    pub game_id: u32,
    pub player_id: u32,
}

/// One wire packet. The enum discriminant is the kind tag on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    // Client -> Server.
    Init(InitData),
    RetrievePlayerInfo(RetrievePlayerInfoData),
    CreateGame(CreateGameData),
    JoinGame(JoinGameData),
    // Server -> Client.
    InitAck(InitAckData),
    PlayerInfo(PlayerInfoData),
    Error(ErrorData),
    GameListNew(GameListNewData),
    GameListUpdate(GameListUpdateData),
    GameListPlayerJoined(GameListPlayerJoinedData),
    GameListPlayerLeft(GameListPlayerLeftData),
}

impl Packet {
    /// Name of the packet kind, for log output.
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Packet::Init(_) => "Init",
            Packet::RetrievePlayerInfo(_) => "RetrievePlayerInfo",
            Packet::CreateGame(_) => "CreateGame",
            Packet::JoinGame(_) => "JoinGame",
            Packet::InitAck(_) => "InitAck",
            Packet::PlayerInfo(_) => "PlayerInfo",
            Packet::Error(_) => "Error",
            Packet::GameListNew(_) => "GameListNew",
            Packet::GameListUpdate(_) => "GameListUpdate",
            Packet::GameListPlayerJoined(_) => "GameListPlayerJoined",
            Packet::GameListPlayerLeft(_) => "GameListPlayerLeft",
        }
    }
}
