#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RespawnMode {
    #[default]
    None = 0,
    Normal = 1,
    Anytime = 2,
}

impl RespawnMode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Normal,
            2 => Self::Anytime,
            _ => Self::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Normal => "normal",
            Self::Anytime => "anytime",
        }
    }
}

/// What a host says about the module it is running. `host` is filled in
/// by whoever received the description and never goes over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModuleDescriptor {
    pub host: String,
    pub rank: String,
    pub long_name: String,
    pub load_name: String,
    pub import_amount: u8,
    pub allow_export: bool,
    pub min_players: u8,
    pub max_players: u8,
    pub monsters_only: bool,
    pub rts_control: bool,
    pub respawn_mode: RespawnMode,
}

impl ModuleDescriptor {
    pub fn new(load_name: &str, long_name: &str) -> Self {
        Self {
            load_name: load_name.to_owned(),
            long_name: long_name.to_owned(),
            min_players: 1,
            max_players: 1,
            ..Self::default()
        }
    }

    pub fn accepts_players(&self, count: usize) -> bool {
        count >= self.min_players as usize && count <= self.max_players as usize
    }
}
