use log::{debug, info, trace};

use crate::device::types::DeviceInfo;
use crate::error::{CommandError, ParseError};
use crate::protocol::{BatteryLevelCallback, CommandChannel, DeviceInfoCallback, DeviceProtocol, ResponseChannel};

/**
 * Trailing characters of the service UUIDs used by the known hardware generations.
 * - 0000fff0-0000-1000-8000-00805f9b34fb (early devices)
 * - 6e400001-b5a3-f393-e0a9-e50e24dcca9e (second generation)
 * - ...a6920e4c5653 (third generation)
 */
pub const SERVICE_UUID_SUFFIXES: [&str; 3] = ["05f9b34fb", "e50e24dcca9e", "a6920e4c5653"];

/**
 * Fragments found in the advertised names of the vendor's devices.
 */
pub const NAME_FRAGMENTS: [&str; 3] = ["LVS", "Lovense", "LLS"];

pub const MAX_VIBRATION: u8 = 20;
pub const MAX_ROTATION: u8 = 20;
pub const MAX_AIR_LEVEL: u8 = 4;
pub const MIN_AIR_ADJUSTMENT: u8 = 1;
pub const MAX_AIR_ADJUSTMENT: u8 = 4;

const TERMINATOR: char = ';';
const DELIMITER: char = ':';
const BATTERY_PREFIX: &str = "Battery:";

pub fn is_lovense_service(uuid: &str) -> bool {
    let uuid = uuid.to_ascii_lowercase();
    SERVICE_UUID_SUFFIXES.iter().any(|suffix| uuid.ends_with(suffix))
}

pub fn is_lovense_name(name: &str) -> bool {
    NAME_FRAGMENTS.iter().any(|fragment| name.contains(fragment))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LovenseModel {
    Unknown,
    Nora,
    Max,
    Ambi,
    Lush,
    Hush,
    Domi,
    Edge,
    Osci,
    Tenera,
}

impl LovenseModel {
    pub fn from_letter(letter: &str) -> LovenseModel {
        match letter {
            // both letters are reported by Nora devices
            "A" | "C" => LovenseModel::Nora,
            "B" => LovenseModel::Max,
            "L" => LovenseModel::Ambi,
            "S" => LovenseModel::Lush,
            "Z" => LovenseModel::Hush,
            "W" => LovenseModel::Domi,
            "P" => LovenseModel::Edge,
            "O" => LovenseModel::Osci,
            "Q" => LovenseModel::Tenera,
            _ => LovenseModel::Unknown,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            LovenseModel::Unknown => "UNKNOWN",
            LovenseModel::Nora => "NORA",
            LovenseModel::Max => "MAX",
            LovenseModel::Ambi => "AMBI",
            LovenseModel::Lush => "LUSH",
            LovenseModel::Hush => "HUSH",
            LovenseModel::Domi => "DOMI",
            LovenseModel::Edge => "EDGE",
            LovenseModel::Osci => "OSCI",
            LovenseModel::Tenera => "TENERA",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `"<ModelLetter>:<Firmware>:<MAC>;"`
    Identity { model_letter: String, firmware_version: String, mac_address: String },
    /// `"85;"` or `"Battery:85;"`
    Battery(u8),
}

/// Parse the leading (optionally signed) integer of `text`, `None` if it does not start with one.
fn leading_int(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };

    let end = digits.find(|c: char| !c.is_ascii_digit()).unwrap_or(digits.len());
    if end == 0 {
        return None;
    }

    let value = digits[..end].parse::<i64>().unwrap_or(i64::MAX);
    Some(if negative { -value } else { value })
}

fn parse_battery(text: &str, response: &str) -> Result<Response, ParseError> {
    let value = leading_int(text).ok_or_else(|| ParseError::Unrecognized(response.to_string()))?;

    match u8::try_from(value) {
        Ok(level) if level <= 100 => Ok(Response::Battery(level)),
        _ => Err(ParseError::BatteryOutOfRange(value)),
    }
}

fn parse_identity(response: &str) -> Result<Response, ParseError> {
    let malformed = || ParseError::MalformedIdentity(response.to_string());

    let terminator = response.find(TERMINATOR).ok_or_else(malformed)?;
    let mut fields = response[..terminator].splitn(3, DELIMITER);

    let model_letter = fields.next().ok_or_else(malformed)?;
    let firmware_version = fields.next().ok_or_else(malformed)?;
    let mac_address = fields.next().ok_or_else(malformed)?;

    Ok(Response::Identity {
        model_letter: model_letter.to_string(),
        firmware_version: firmware_version.to_string(),
        mac_address: mac_address.to_string(),
    })
}

pub fn parse_response(response: &str) -> Result<Response, ParseError> {
    if !response.contains(TERMINATOR) {
        return Err(ParseError::Unterminated(response.to_string()));
    }

    if let Some(rest) = response.strip_prefix(BATTERY_PREFIX) {
        return parse_battery(rest, response);
    }

    let delimiters = response.matches(DELIMITER).count();
    if delimiters > 0 {
        if delimiters == 2 && response.chars().nth(1) == Some(DELIMITER) {
            return parse_identity(response);
        }

        return Err(ParseError::Unrecognized(response.to_string()));
    }

    // A bare number is either a battery level or a status code; only the former is understood.
    let starts_numeric = response.chars().next().map_or(false, |c| c.is_ascii_digit());
    if starts_numeric && response.ends_with(TERMINATOR) {
        return parse_battery(response, response);
    }

    Err(ParseError::Unrecognized(response.to_string()))
}

pub struct LovenseProtocol {
    command_channel: Option<CommandChannel>,
    response_channel: Option<ResponseChannel>,

    model: LovenseModel,
    model_letter: Option<String>,
    firmware_version: Option<String>,
    mac_address: Option<String>,
    battery_level: Option<u8>,

    device_info_callback: Option<DeviceInfoCallback>,
    battery_level_callback: Option<BatteryLevelCallback>,
}

impl LovenseProtocol {
    pub fn new() -> Self {
        LovenseProtocol {
            command_channel: None,
            response_channel: None,
            model: LovenseModel::Unknown,
            model_letter: None,
            firmware_version: None,
            mac_address: None,
            battery_level: None,
            device_info_callback: None,
            battery_level_callback: None,
        }
    }

    pub fn model(&self) -> LovenseModel {
        self.model
    }

    pub fn model_letter(&self) -> Option<&str> {
        self.model_letter.as_deref()
    }

    pub fn firmware_version(&self) -> Option<&str> {
        self.firmware_version.as_deref()
    }

    pub fn mac_address(&self) -> Option<&str> {
        self.mac_address.as_deref()
    }

    pub fn battery_level(&self) -> Option<u8> {
        self.battery_level
    }

    fn send_command(&mut self, command: &str) -> Result<(), CommandError> {
        if !self.is_ready() {
            info!("Lovense protocol not ready to send commands");
            return Err(CommandError::NotReady);
        }

        trace!("Lovense command: {}", command);
        match self.command_channel.as_mut() {
            Some(channel) => channel.write(command.as_bytes()),
            None => Err(CommandError::NotReady),
        }
    }

    fn apply_response(&mut self, response: Response) {
        match response {
            Response::Identity { model_letter, firmware_version, mac_address } => {
                self.model = LovenseModel::from_letter(&model_letter);
                self.model_letter = Some(model_letter);
                self.firmware_version = Some(firmware_version.clone());
                self.mac_address = Some(mac_address.clone());

                let info = DeviceInfo {
                    model_type: self.model.display_name().to_string(),
                    firmware_version,
                    mac_address,
                    battery_level: self.battery_level,
                };

                if let Some(callback) = self.device_info_callback.as_mut() {
                    callback(&info);
                }
            },
            Response::Battery(level) => {
                self.battery_level = Some(level);

                if let Some(callback) = self.battery_level_callback.as_mut() {
                    callback(level);
                }
            },
        }
    }
}

impl Default for LovenseProtocol {
    fn default() -> Self {
        LovenseProtocol::new()
    }
}

impl DeviceProtocol for LovenseProtocol {
    fn bind_command_channel(&mut self, channel: CommandChannel) {
        self.command_channel = Some(channel);
    }

    fn bind_response_channel(&mut self, channel: ResponseChannel) {
        self.response_channel = Some(channel);
    }

    fn clear_channels(&mut self) -> Option<ResponseChannel> {
        self.command_channel = None;
        self.response_channel.take()
    }

    fn response_channel(&self) -> Option<&ResponseChannel> {
        self.response_channel.as_ref()
    }

    fn is_ready(&self) -> bool {
        self.command_channel.as_ref().map_or(false, |channel| channel.can_write())
    }

    fn is_compatible_service(&self, uuid: &str) -> bool {
        is_lovense_service(uuid)
    }

    fn is_compatible_name(&self, name: &str) -> bool {
        is_lovense_name(name)
    }

    fn set_vibration(&mut self, level: u8) -> Result<(), CommandError> {
        let level = level.min(MAX_VIBRATION);
        self.send_command(&format!("Vibrate:{};", level))
    }

    fn set_rotation(&mut self, level: u8) -> Result<(), CommandError> {
        let level = level.min(MAX_ROTATION);
        self.send_command(&format!("Rotate:{};", level))
    }

    fn change_rotation_direction(&mut self) -> Result<(), CommandError> {
        self.send_command("RotateChange;")
    }

    fn set_air_level(&mut self, level: u8) -> Result<(), CommandError> {
        let level = level.min(MAX_AIR_LEVEL);
        self.send_command(&format!("Air:Level:{};", level))
    }

    fn adjust_air_level_relative(&mut self, inflate: bool, amount: u8) -> Result<(), CommandError> {
        let amount = amount.clamp(MIN_AIR_ADJUSTMENT, MAX_AIR_ADJUSTMENT);
        let direction = if inflate { "In" } else { "Out" };
        self.send_command(&format!("Air:{}:{};", direction, amount))
    }

    fn power_off(&mut self) -> Result<(), CommandError> {
        self.send_command("PowerOff;")
    }

    fn query_device_type(&mut self) -> Result<(), CommandError> {
        self.send_command("DeviceType;")
    }

    fn query_battery_level(&mut self) -> Result<(), CommandError> {
        self.send_command("Battery;")
    }

    fn model_display_name(&self) -> String {
        self.model.display_name().to_string()
    }

    fn handle_response(&mut self, response: &[u8]) {
        let response = String::from_utf8_lossy(response);

        match parse_response(&response) {
            Ok(parsed) => {
                debug!("Lovense reply: {:?}", parsed);
                self.apply_response(parsed);
            },
            Err(err @ ParseError::Unterminated(_)) => info!("Invalid response format: {}", err),
            Err(err) => debug!("Ignoring response: {}", err),
        }
    }

    fn set_device_info_callback(&mut self, callback: DeviceInfoCallback) {
        self.device_info_callback = Some(callback);
    }

    fn set_battery_level_callback(&mut self, callback: BatteryLevelCallback) {
        self.battery_level_callback = Some(callback);
    }
}
