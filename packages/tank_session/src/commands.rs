/// One line of console input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Chat(String),
    /// Steering in [-1, 1], engine force, and brake force for the local tank.
    Drive {
        steering: f64,
        engine: f64,
        brake: f64,
    },
    Honk,
    Shoot,
    Lights,
    Peers,
    Status,
    Quit,
    Unknown(String),
}

impl Command {
    /// Lines starting with `/` are commands; anything else is chat.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Some(Command::Chat(line.to_string()));
        };
        let mut words = rest.split_whitespace();
        let name = words.next().unwrap_or_default();
        Some(match name.to_ascii_lowercase().as_str() {
            "drive" => match drive_args(words) {
                Some(drive) => drive,
                None => Command::Unknown(name.to_string()),
            },
            "stop" => Command::Drive {
                steering: 0.0,
                engine: 0.0,
                brake: 0.0,
            },
            "honk" => Command::Honk,
            "shoot" | "fire" => Command::Shoot,
            "lights" => Command::Lights,
            "peers" | "who" => Command::Peers,
            "status" => Command::Status,
            "quit" | "exit" => Command::Quit,
            _ => Command::Unknown(name.to_string()),
        })
    }
}

/// `STEER ENGINE [BRAKE]`, all numbers.
fn drive_args<'a>(mut words: impl Iterator<Item = &'a str>) -> Option<Command> {
    let steering = words.next()?.parse().ok()?;
    let engine = words.next()?.parse().ok()?;
    let brake = match words.next() {
        Some(word) => word.parse().ok()?,
        None => 0.0,
    };
    if words.next().is_some() {
        return None;
    }
    Some(Command::Drive {
        steering,
        engine,
        brake,
    })
}

pub const HELP: &str = "commands: /drive STEER ENGINE [BRAKE] /stop /honk /shoot /lights /peers /status /quit (anything else is chat)";
