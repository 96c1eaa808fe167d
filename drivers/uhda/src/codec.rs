//! Codec handles and the widget graph
//!
//! Each codec on the link owns an arena of widgets keyed by node id. Output
//! groups, outputs and paths refer to widgets by node id only, so the graph
//! has a single owner and no internal references.
//!
//! Topology discovery (reading widget capabilities and connection lists) is
//! delegated to a [`CodecTopology`] implementation supplied by the host.

use alloc::{collections::BTreeMap, vec::Vec};

use bitflags::bitflags;
use log::debug;

use crate::{
    error::{UhdaError, UhdaResult},
    format::PcmFormat,
    path::Path,
    verb::{VerbDescriptor, VerbQueue},
};

/// Node id of a widget within its codec
pub type Nid = u8;

/// Verb command identifiers
pub mod commands {
    pub const GET_PARAMETER: u16 = 0xF00;
    pub const SET_CONNECTION_SELECT: u16 = 0x701;
    pub const SET_POWER_STATE: u16 = 0x705;
    pub const SET_CONVERTER_CONTROL: u16 = 0x706;
    pub const SET_PIN_CONTROL: u16 = 0x707;
    pub const SET_EAPD_BTL: u16 = 0x70C;
    pub const SET_CONVERTER_CHANNEL_COUNT: u16 = 0x72D;

    /// Long form commands (16-bit payload)
    pub const SET_CONVERTER_FORMAT: u8 = 0x2;
    pub const SET_AMP_GAIN_MUTE: u8 = 0x3;

    /// GET_PARAMETER selectors
    pub const PARAM_VENDOR_ID: u8 = 0x00;
}

// ============================================================================
// Widgets
// ============================================================================

bitflags! {
    /// Pin widget capabilities
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PinCapabilities: u32 {
        const HEADPHONE_DRIVE = 1 << 3;
        const OUTPUT = 1 << 4;
        const INPUT = 1 << 5;
        /// External amplifier power-down control (EAPD)
        const EAPD = 1 << 16;
    }
}

/// Output amplifier capabilities
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AmpCapabilities(pub u32);

impl AmpCapabilities {
    /// Gain step that corresponds to 0 dB
    pub fn offset(self) -> u8 {
        (self.0 & 0x7F) as u8
    }

    /// Highest gain step the amplifier accepts
    pub fn num_steps(self) -> u8 {
        ((self.0 >> 8) & 0x7F) as u8
    }

    pub fn mute_capable(self) -> bool {
        self.0 & (1 << 31) != 0
    }
}

/// Widget type with the data specific to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetKind {
    AudioOutput,
    AudioInput,
    AudioMixer,
    AudioSelector,
    PinComplex {
        caps: PinCapabilities,
        /// Configuration default register
        config_default: u32,
    },
    Power,
    VolumeKnob,
    BeepGenerator,
    VendorDefined,
}

/// Node in the codec graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Widget {
    pub nid: Nid,
    pub kind: WidgetKind,
    /// Connection list entries; bit 7 marks the end of a range that starts
    /// at the preceding entry
    pub connections: Vec<u8>,
    pub out_amp_caps: AmpCapabilities,
}

impl Widget {
    pub fn new(nid: Nid, kind: WidgetKind) -> Self {
        Self {
            nid,
            kind,
            connections: Vec::new(),
            out_amp_caps: AmpCapabilities::default(),
        }
    }

    pub fn with_connections(mut self, connections: &[u8]) -> Self {
        self.connections = connections.to_vec();
        self
    }

    pub fn with_out_amp(mut self, caps: AmpCapabilities) -> Self {
        self.out_amp_caps = caps;
        self
    }

    /// Number of inputs the connection list describes, ranges expanded
    pub fn connection_count(&self) -> usize {
        let mut count = 0;
        for (i, &entry) in self.connections.iter().enumerate() {
            if entry & RANGE_FLAG != 0 && i > 0 {
                let start = self.connections[i - 1] & 0x7F;
                count += (entry & 0x7F).saturating_sub(start) as usize;
            } else {
                count += 1;
            }
        }
        count
    }

    /// Selector index of input `nid` in the connection list
    ///
    /// Ranges are inclusive and expanded, so the result is the position of
    /// `nid` in the flattened list of inputs.
    pub fn connection_index(&self, nid: Nid) -> Option<u8> {
        let mut index: usize = 0;
        for (i, &entry) in self.connections.iter().enumerate() {
            if entry & RANGE_FLAG != 0 && i > 0 {
                // The range start was already counted as a single entry
                let start = self.connections[i - 1] & 0x7F;
                let end = entry & 0x7F;
                if nid > start && nid <= end {
                    index += (nid - start) as usize - 1;
                    return u8::try_from(index).ok();
                }
                index += end.saturating_sub(start) as usize;
            } else {
                if entry & 0x7F == nid {
                    return u8::try_from(index).ok();
                }
                index += 1;
            }
        }
        None
    }
}

const RANGE_FLAG: u8 = 1 << 7;

// ============================================================================
// Outputs
// ============================================================================

/// Device class of an output pin, from its configuration default
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    LineOut,
    Speaker,
    Headphone,
    Cd,
    SpdifOut,
    OtherDigitalOut,
    Unknown,
}

impl OutputType {
    /// Classify a configuration default register value
    pub fn from_config_default(config_default: u32) -> Self {
        match (config_default >> 20) & 0xF {
            0x0 => Self::LineOut,
            0x1 => Self::Speaker,
            0x2 => Self::Headphone,
            0x3 => Self::Cd,
            0x4 => Self::SpdifOut,
            0x5 => Self::OtherDigitalOut,
            _ => Self::Unknown,
        }
    }
}

/// Description of one output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputInfo {
    pub kind: OutputType,
}

/// Physical output: one pin widget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Output {
    pub pin: Nid,
}

/// Outputs the topology considers one logical device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputGroup {
    outputs: Vec<Output>,
}

impl OutputGroup {
    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Fills in the widget graph of a newly enumerated codec
///
/// Implementations issue whatever verbs they need through `verbs`, then
/// register widgets, output groups and output paths on `codec`.
pub trait CodecTopology: Send + Sync {
    fn discover(&self, codec: &mut Codec, verbs: &mut VerbQueue) -> UhdaResult<()>;
}

/// One codec on the HD-Audio link
#[derive(Debug)]
pub struct Codec {
    address: u8,
    vendor_id: u32,
    widgets: BTreeMap<Nid, Widget>,
    output_groups: Vec<OutputGroup>,
    pub(crate) output_paths: Vec<Path>,
}

impl Codec {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            vendor_id: 0,
            widgets: BTreeMap::new(),
            output_groups: Vec::new(),
            output_paths: Vec::new(),
        }
    }

    /// Identify the codec and discover its topology
    pub fn init(&mut self, verbs: &mut VerbQueue, topology: &dyn CodecTopology) -> UhdaResult<()> {
        self.vendor_id = self.get_parameter(verbs, 0, commands::PARAM_VENDOR_ID)?;
        debug!(
            "uhda: codec {} vendor {:#06x} device {:#06x}",
            self.address,
            self.vendor_id >> 16,
            self.vendor_id & 0xFFFF
        );
        topology.discover(self, verbs)
    }

    /// Codec address on the link (0..=14)
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn vendor_id(&self) -> u32 {
        self.vendor_id
    }

    pub fn widget(&self, nid: Nid) -> Option<&Widget> {
        self.widgets.get(&nid)
    }

    pub(crate) fn widget_checked(&self, nid: Nid) -> UhdaResult<&Widget> {
        self.widgets.get(&nid).ok_or(UhdaError::Unsupported)
    }

    pub fn output_groups(&self) -> &[OutputGroup] {
        &self.output_groups
    }

    pub fn output_paths(&self) -> &[Path] {
        &self.output_paths
    }

    /// Classify `output` by its pin's default device
    pub fn output_info(&self, output: &Output) -> OutputInfo {
        let kind = match self.widgets.get(&output.pin).map(|w| w.kind) {
            Some(WidgetKind::PinComplex { config_default, .. }) => {
                OutputType::from_config_default(config_default)
            }
            _ => OutputType::Unknown,
        };
        OutputInfo { kind }
    }

    // ------------------------------------------------------------------------
    // Topology registration
    // ------------------------------------------------------------------------

    pub fn insert_widget(&mut self, widget: Widget) {
        self.widgets.insert(widget.nid, widget);
    }

    /// Register a group of output pins
    pub fn add_output_group(&mut self, pins: &[Nid]) -> UhdaResult<()> {
        let mut outputs = Vec::new();
        outputs.try_reserve_exact(pins.len())?;
        for &pin in pins {
            self.expect_pin(pin)?;
            outputs.push(Output { pin });
        }
        self.output_groups.try_reserve(1)?;
        self.output_groups.push(OutputGroup { outputs });
        Ok(())
    }

    /// Register a path, listed from the output pin to the converter
    pub fn add_output_path(&mut self, widgets: &[Nid]) -> UhdaResult<()> {
        let (&pin, rest) = widgets.split_first().ok_or(UhdaError::Unsupported)?;
        self.expect_pin(pin)?;
        for &nid in rest {
            self.widget_checked(nid)?;
        }
        let path = Path::new(self.address, widgets)?;
        self.output_paths.try_reserve(1)?;
        self.output_paths.push(path);
        Ok(())
    }

    fn expect_pin(&self, nid: Nid) -> UhdaResult<()> {
        match self.widget_checked(nid)?.kind {
            WidgetKind::PinComplex { .. } => Ok(()),
            _ => Err(UhdaError::Unsupported),
        }
    }

    // ------------------------------------------------------------------------
    // Verbs
    // ------------------------------------------------------------------------

    fn send(&self, verbs: &mut VerbQueue, nid: Nid, cmd: u16, data: u8) -> UhdaResult<u32> {
        let response = verbs.command(VerbDescriptor::short(self.address, nid, cmd, data))?;
        Ok(response.response)
    }

    fn send_long(&self, verbs: &mut VerbQueue, nid: Nid, cmd: u8, data: u16) -> UhdaResult<u32> {
        let response = verbs.command(VerbDescriptor::long(self.address, nid, cmd, data))?;
        Ok(response.response)
    }

    pub fn get_parameter(&self, verbs: &mut VerbQueue, nid: Nid, param: u8) -> UhdaResult<u32> {
        self.send(verbs, nid, commands::GET_PARAMETER, param)
    }

    pub fn set_connection_select(&self, verbs: &mut VerbQueue, nid: Nid, index: u8) -> UhdaResult<()> {
        self.send(verbs, nid, commands::SET_CONNECTION_SELECT, index).map(drop)
    }

    /// `state` 0 is D0 (fully on)
    pub fn set_power_state(&self, verbs: &mut VerbQueue, nid: Nid, state: u8) -> UhdaResult<()> {
        self.send(verbs, nid, commands::SET_POWER_STATE, state).map(drop)
    }

    /// Bind a converter to stream tag `stream` (0 unbinds) and first channel
    pub fn set_converter_control(
        &self,
        verbs: &mut VerbQueue,
        nid: Nid,
        stream: u8,
        channel: u8,
    ) -> UhdaResult<()> {
        let data = (stream << 4) | (channel & 0xF);
        self.send(verbs, nid, commands::SET_CONVERTER_CONTROL, data).map(drop)
    }

    pub fn set_pin_control(&self, verbs: &mut VerbQueue, nid: Nid, control: u8) -> UhdaResult<()> {
        self.send(verbs, nid, commands::SET_PIN_CONTROL, control).map(drop)
    }

    pub fn set_eapd_enable(&self, verbs: &mut VerbQueue, nid: Nid, value: u8) -> UhdaResult<()> {
        self.send(verbs, nid, commands::SET_EAPD_BTL, value).map(drop)
    }

    pub fn set_converter_format(
        &self,
        verbs: &mut VerbQueue,
        nid: Nid,
        format: PcmFormat,
    ) -> UhdaResult<()> {
        self.send_long(verbs, nid, commands::SET_CONVERTER_FORMAT, format.bits())
            .map(drop)
    }

    /// `count` is the channel count minus one
    pub fn set_converter_channel_count(
        &self,
        verbs: &mut VerbQueue,
        nid: Nid,
        count: u8,
    ) -> UhdaResult<()> {
        self.send(verbs, nid, commands::SET_CONVERTER_CHANNEL_COUNT, count)
            .map(drop)
    }

    pub fn set_amp_gain_mute(&self, verbs: &mut VerbQueue, nid: Nid, data: u16) -> UhdaResult<()> {
        self.send_long(verbs, nid, commands::SET_AMP_GAIN_MUTE, data)
            .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pin(nid: Nid, device: u32) -> Widget {
        Widget::new(
            nid,
            WidgetKind::PinComplex {
                caps: PinCapabilities::OUTPUT,
                config_default: device << 20,
            },
        )
    }

    #[test]
    fn test_connection_index_explicit_entries() {
        let mixer = Widget::new(0x0C, WidgetKind::AudioMixer).with_connections(&[0x02, 0x0B]);
        assert_eq!(mixer.connection_index(0x02), Some(0));
        assert_eq!(mixer.connection_index(0x0B), Some(1));
        assert_eq!(mixer.connection_index(0x03), None);
        assert_eq!(mixer.connection_count(), 2);
    }

    #[test]
    fn test_connection_index_inside_range() {
        // 0x05..=0x08 followed by 0x0A
        let selector = Widget::new(0x20, WidgetKind::AudioSelector)
            .with_connections(&[0x05, 0x80 | 0x08, 0x0A]);
        assert_eq!(selector.connection_count(), 5);
        assert_eq!(selector.connection_index(0x05), Some(0));
        assert_eq!(selector.connection_index(0x06), Some(1));
        assert_eq!(selector.connection_index(0x08), Some(3));
        assert_eq!(selector.connection_index(0x0A), Some(4));
        assert_eq!(selector.connection_index(0x09), None);
    }

    #[test]
    fn test_output_classification() {
        let mut codec = Codec::new(0);
        codec.insert_widget(pin(0x14, 0x1));
        codec.insert_widget(pin(0x15, 0x2));
        codec.insert_widget(pin(0x16, 0x9));
        codec.add_output_group(&[0x14, 0x15]).unwrap();
        codec.add_output_group(&[0x16]).unwrap();

        let groups = codec.output_groups();
        assert_eq!(groups.len(), 2);
        let kinds: Vec<_> = groups[0]
            .outputs()
            .iter()
            .map(|o| codec.output_info(o).kind)
            .collect();
        assert_eq!(kinds, [OutputType::Speaker, OutputType::Headphone]);
        assert_eq!(
            codec.output_info(&groups[1].outputs()[0]).kind,
            OutputType::Unknown
        );
    }

    #[test]
    fn test_paths_must_start_at_pin() {
        let mut codec = Codec::new(0);
        codec.insert_widget(pin(0x14, 0x0));
        codec.insert_widget(Widget::new(0x02, WidgetKind::AudioOutput));

        assert_eq!(codec.add_output_path(&[0x02]), Err(UhdaError::Unsupported));
        assert_eq!(codec.add_output_path(&[0x14, 0x03]), Err(UhdaError::Unsupported));
        assert!(codec.add_output_path(&[0x14, 0x02]).is_ok());
        assert_eq!(codec.output_paths()[0].widgets(), &[0x14, 0x02]);
    }

    #[test]
    fn test_amp_caps_fields() {
        let caps = AmpCapabilities(0x8005_7F3C);
        assert_eq!(caps.offset(), 0x3C);
        assert_eq!(caps.num_steps(), 0x7F);
        assert!(caps.mute_capable());
    }
}
