//! Output paths through a codec
//!
//! A path lists widget node ids from an output pin back to the audio output
//! converter feeding it. Paths are precomputed by the topology; this module
//! decides which paths can run together and programs a path's widgets.

use alloc::vec::Vec;

use log::debug;

use crate::{
    codec::{Codec, Nid, Output, PinCapabilities, WidgetKind},
    error::{UhdaError, UhdaResult},
    format::{PcmFormat, StreamParams},
    stream::Stream,
    verb::VerbQueue,
};

/// Amplifier gain/mute payload bits
const AMP_SET_OUTPUT: u16 = 1 << 15;
const AMP_SET_LEFT: u16 = 1 << 13;
const AMP_SET_RIGHT: u16 = 1 << 12;
const AMP_MUTE: u16 = 1 << 7;
const AMP_GAIN_MASK: u16 = 0x7F;

/// Pin widget control bits
const PIN_OUT_ENABLE: u8 = 1 << 6;
const PIN_HP_ENABLE: u8 = 1 << 7;

/// EAPD/BTL enable: external amplifier powered
const EAPD_ENABLE: u8 = 1 << 1;

/// Power state D0
const POWER_D0: u8 = 0;

/// Payload writing `gain` to both channels of an output amplifier
fn amp_payload(gain: u8, mute: bool) -> u16 {
    let mut data = AMP_SET_OUTPUT | AMP_SET_LEFT | AMP_SET_RIGHT | (gain as u16 & AMP_GAIN_MASK);
    if mute {
        data |= AMP_MUTE;
    }
    data
}

/// Route from an output pin (index 0) to an audio output converter (last)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    codec: u8,
    widgets: Vec<Nid>,
    gain: u8,
}

impl Path {
    pub(crate) fn new(codec: u8, widgets: &[Nid]) -> UhdaResult<Self> {
        let mut list = Vec::new();
        list.try_reserve_exact(widgets.len())?;
        list.extend_from_slice(widgets);
        Ok(Self {
            codec,
            widgets: list,
            gain: 0,
        })
    }

    /// Address of the codec the path runs through
    pub fn codec(&self) -> u8 {
        self.codec
    }

    pub fn widgets(&self) -> &[Nid] {
        &self.widgets
    }

    pub fn pin(&self) -> Nid {
        self.widgets[0]
    }

    pub fn converter(&self) -> Nid {
        self.widgets[self.widgets.len() - 1]
    }

    /// Last gain step written to the converter amplifier
    pub fn gain(&self) -> u8 {
        self.gain
    }

    /// Widget at `index`, qualified by codec so paths of different codecs
    /// never compare equal
    fn node(&self, index: usize) -> (u8, Nid) {
        (self.codec, self.widgets[index])
    }
}

/// Whether all `paths` can be active at the same time
///
/// For every pair of steps taken by two different paths: reaching a widget
/// from the same predecessor means the paths share a source, which only works
/// when they carry the same stream; reaching the same widget from different
/// predecessors is never possible. The pins at index 0 are only compared as
/// predecessors.
pub fn paths_usable_simultaneously(paths: &[&Path], same_stream: bool) -> bool {
    for (i, path) in paths.iter().enumerate() {
        for step in 1..path.widgets.len() {
            let widget = path.node(step);
            let predecessor = path.node(step - 1);

            for (j, other) in paths.iter().enumerate() {
                if j == i {
                    continue;
                }
                for other_step in 1..other.widgets.len() {
                    if predecessor == other.node(other_step - 1) {
                        if !same_stream {
                            return false;
                        }
                    } else if widget == other.node(other_step) {
                        return false;
                    }
                }
            }
        }
    }
    true
}

impl Codec {
    /// First path to `dest` that can run alongside every path in `others`
    ///
    /// Returns the path's index in [`Codec::output_paths`].
    pub fn find_path(&self, dest: &Output, others: &[&Path], same_stream: bool) -> UhdaResult<usize> {
        self.output_paths
            .iter()
            .enumerate()
            .filter(|(_, path)| path.pin() == dest.pin)
            .find(|(_, path)| {
                others
                    .iter()
                    .all(|other| paths_usable_simultaneously(&[*path, *other], same_stream))
            })
            .map(|(index, _)| index)
            .ok_or(UhdaError::Unsupported)
    }

    fn path_checked(&self, path: usize) -> UhdaResult<&Path> {
        self.output_paths.get(path).ok_or(UhdaError::Unsupported)
    }

    /// Converter terminating `path`, which must be an audio output widget
    fn path_converter(&self, path: &Path) -> UhdaResult<(Nid, u8)> {
        let converter = self.widget_checked(path.converter())?;
        match converter.kind {
            WidgetKind::AudioOutput => Ok((converter.nid, converter.out_amp_caps.num_steps())),
            _ => Err(UhdaError::Unsupported),
        }
    }

    /// Program every widget of `path` to play `stream`
    ///
    /// `params` is rewritten with the format the converter runs at. The
    /// route runs from the pin to the converter, and every widget with more
    /// than one input, the pin included, selects the next widget towards the
    /// converter as its input.
    pub fn setup_path(
        &mut self,
        verbs: &mut VerbQueue,
        path: usize,
        params: &mut StreamParams,
        stream: &Stream,
    ) -> UhdaResult<()> {
        if !stream.is_output() {
            return Err(UhdaError::Unsupported);
        }
        let route = self.path_checked(path)?;
        let (converter, _) = self.path_converter(route)?;

        let format = PcmFormat::negotiate(params);
        self.set_converter_format(verbs, converter, format)?;
        self.set_converter_channel_count(verbs, converter, format.channel_field())?;

        let mut gain = route.gain;
        for (i, &nid) in route.widgets.iter().enumerate() {
            let widget = self.widget_checked(nid)?;

            // Select the next widget towards the converter as this one's input
            if let Some(&upstream) = route.widgets.get(i + 1) {
                if widget.connection_count() > 1 {
                    let index = widget
                        .connection_index(upstream)
                        .ok_or(UhdaError::Unsupported)?;
                    self.set_connection_select(verbs, nid, index)?;
                }
            }

            self.set_power_state(verbs, nid, POWER_D0)?;

            let max_step = widget.out_amp_caps.num_steps();
            match widget.kind {
                WidgetKind::PinComplex { caps, .. } => {
                    if caps.contains(PinCapabilities::EAPD) {
                        self.set_eapd_enable(verbs, nid, EAPD_ENABLE)?;
                    }
                    self.set_amp_gain_mute(verbs, nid, amp_payload(max_step, false))?;
                    self.set_pin_control(verbs, nid, PIN_HP_ENABLE | PIN_OUT_ENABLE)?;
                }
                WidgetKind::AudioMixer => {
                    self.set_amp_gain_mute(verbs, nid, amp_payload(max_step, false))?;
                }
                WidgetKind::AudioOutput => {
                    self.set_converter_control(verbs, nid, stream.index() + 1, 0)?;
                    gain = max_step / 2;
                    self.set_amp_gain_mute(verbs, nid, amp_payload(gain, false))?;
                }
                WidgetKind::AudioInput
                | WidgetKind::AudioSelector
                | WidgetKind::Power
                | WidgetKind::VolumeKnob
                | WidgetKind::BeepGenerator
                | WidgetKind::VendorDefined => {}
            }
        }

        debug!(
            "uhda: codec {} path {} bound to stream {}, gain {}",
            self.address(),
            path,
            stream.index(),
            gain
        );
        self.output_paths[path].gain = gain;
        Ok(())
    }

    /// Mute `path` and release its converter
    ///
    /// Widgets keep their power state.
    pub fn shutdown_path(&self, verbs: &mut VerbQueue, path: usize) -> UhdaResult<()> {
        let route = self.path_checked(path)?;
        for &nid in &route.widgets {
            match self.widget_checked(nid)?.kind {
                WidgetKind::PinComplex { .. } => {
                    self.set_amp_gain_mute(verbs, nid, amp_payload(0, true))?;
                    self.set_pin_control(verbs, nid, 0)?;
                }
                WidgetKind::AudioMixer => {
                    self.set_amp_gain_mute(verbs, nid, amp_payload(0, true))?;
                }
                WidgetKind::AudioOutput => {
                    self.set_converter_control(verbs, nid, 0, 0)?;
                }
                WidgetKind::AudioInput
                | WidgetKind::AudioSelector
                | WidgetKind::Power
                | WidgetKind::VolumeKnob
                | WidgetKind::BeepGenerator
                | WidgetKind::VendorDefined => {}
            }
        }
        Ok(())
    }

    /// Scale the converter amplifier to `volume` percent (clamped to 100)
    pub fn set_path_volume(&mut self, verbs: &mut VerbQueue, path: usize, volume: u32) -> UhdaResult<()> {
        let route = self.path_checked(path)?;
        let (converter, max_step) = self.path_converter(route)?;

        let gain = volume_to_gain(volume, max_step);
        self.output_paths[path].gain = gain;
        self.set_amp_gain_mute(verbs, converter, amp_payload(gain, false))
    }

    /// Mute or unmute the converter amplifier, keeping the cached gain
    pub fn mute_path(&self, verbs: &mut VerbQueue, path: usize, mute: bool) -> UhdaResult<()> {
        let route = self.path_checked(path)?;
        let (converter, _) = self.path_converter(route)?;
        self.set_amp_gain_mute(verbs, converter, amp_payload(route.gain, mute))
    }
}

/// Gain step for `volume` percent of an amplifier topping out at `max_step`
fn volume_to_gain(volume: u32, max_step: u8) -> u8 {
    let volume = volume.min(100);
    let one_percentage = (max_step as u32 / 100).max(1);
    let value = one_percentage * volume;
    if value > max_step as u32 || volume == 100 {
        max_step
    } else {
        value as u8
    }
}
