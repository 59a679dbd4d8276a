//! Hardware-priority video encoder selection.
//!
//! `EncoderKind` is a closed tagged enum, not a trait object: the set of
//! backends is compile-time known and adding one is a release, matching the
//! dynamic-dispatch design note this crate implements.

use gstreamer::prelude::*;
use gstreamer::ElementFactory;

/// A usable GStreamer video encoder backend, in descending selection
/// priority: NVENC, Quick Sync, VA-API, VA-API low-power, then software
/// x264.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncoderKind {
    Nvenc,
    Qsv,
    VaApi,
    VaApiLowPower,
    X264,
}

impl EncoderKind {
    /// Selection order, highest priority first.
    pub const PRIORITY: [EncoderKind; 5] = [
        EncoderKind::Nvenc,
        EncoderKind::Qsv,
        EncoderKind::VaApi,
        EncoderKind::VaApiLowPower,
        EncoderKind::X264,
    ];

    /// The GStreamer element factory name backing this encoder.
    #[must_use]
    pub const fn factory_name(self) -> &'static str {
        match self {
            EncoderKind::Nvenc => "nvh264enc",
            EncoderKind::Qsv => "qsvh264enc",
            EncoderKind::VaApi | EncoderKind::VaApiLowPower => "vah264enc",
            EncoderKind::X264 => "x264enc",
        }
    }

    /// Whether this backend accepts `BGRA` directly (hardware colour
    /// conversion) versus needing a `videoconvert` stage from `BGRx`.
    #[must_use]
    pub const fn accepts_bgra_directly(self) -> bool {
        matches!(self, EncoderKind::Nvenc)
    }

    /// Probe whether this encoder is usable on the current host by actually
    /// instantiating the element and transitioning it to `Null`, since the
    /// plugin registry lists elements whose underlying driver may not
    /// actually be present.
    #[must_use]
    pub fn can_instantiate(self) -> bool {
        let Some(factory) = ElementFactory::find(self.factory_name()) else {
            return false;
        };
        match factory.create().build() {
            Ok(element) => {
                let _ = element.set_state(gstreamer::State::Null);
                true
            }
            Err(_) => false,
        }
    }

    /// Detect the highest-priority usable encoder on this host, trying
    /// `preferred` first if given, falling back through [`Self::PRIORITY`].
    #[must_use]
    pub fn detect(preferred: Option<EncoderKind>) -> Option<EncoderKind> {
        if let Some(kind) = preferred {
            if kind.can_instantiate() {
                return Some(kind);
            }
        }
        Self::PRIORITY.into_iter().find(|k| k.can_instantiate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order_matches_spec() {
        assert_eq!(
            EncoderKind::PRIORITY,
            [
                EncoderKind::Nvenc,
                EncoderKind::Qsv,
                EncoderKind::VaApi,
                EncoderKind::VaApiLowPower,
                EncoderKind::X264,
            ]
        );
    }

    #[test]
    fn only_nvenc_accepts_bgra_directly() {
        for kind in EncoderKind::PRIORITY {
            assert_eq!(kind.accepts_bgra_directly(), kind == EncoderKind::Nvenc);
        }
    }

    #[test]
    fn factory_names_are_distinct_or_shared_for_vaapi_variants() {
        assert_eq!(EncoderKind::VaApi.factory_name(), EncoderKind::VaApiLowPower.factory_name());
        assert_ne!(EncoderKind::Nvenc.factory_name(), EncoderKind::X264.factory_name());
    }
}
