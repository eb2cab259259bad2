use std::fmt;
use std::str::FromStr;

/// Input channel of the scope. Not every model carries all eight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
}

impl Channel {
    pub const ALL: [Self; 8] = [
        Self::A,
        Self::B,
        Self::C,
        Self::D,
        Self::E,
        Self::F,
        Self::G,
        Self::H,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::E => "E",
            Self::F => "F",
            Self::G => "G",
            Self::H => "H",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown channel '{0}', expected A to H")]
pub struct ParseChannelError(String);

impl FromStr for Channel {
    type Err = ParseChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|channel| channel.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseChannelError(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Coupling {
    #[default]
    DC,
    AC,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BandwidthLimit {
    #[default]
    Full,
    MHz20,
    MHz200,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeAttenuation {
    #[default]
    X1,
    X10,
}

impl ProbeAttenuation {
    pub fn to_multiplier(&self) -> f64 {
        match self {
            Self::X1 => 1.0,
            Self::X10 => 10.0,
        }
    }
}

/// Input range of a channel, in nanovolts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoltageRange {
    pub min_nv: i64,
    pub max_nv: i64,
}

impl VoltageRange {
    pub fn new(min_nv: i64, max_nv: i64) -> Self {
        Self { min_nv, max_nv }
    }

    /// Symmetric range `±millivolts`.
    pub fn symmetric_mv(millivolts: i64) -> Self {
        Self::new(-millivolts * 1_000_000, millivolts * 1_000_000)
    }

    /// Full-scale value used for scaling: the larger magnitude of the two bounds.
    pub fn full_scale_mv(&self) -> f64 {
        self.min_nv.unsigned_abs().max(self.max_nv.unsigned_abs()) as f64 / 1_000_000.0
    }

    pub fn is_well_formed(&self) -> bool {
        self.min_nv < self.max_nv
    }

    pub fn contains_mv(&self, millivolts: f64) -> bool {
        let nv = millivolts * 1_000_000.0;
        nv >= self.min_nv as f64 && nv <= self.max_nv as f64
    }
}

impl Default for VoltageRange {
    fn default() -> Self {
        Self::symmetric_mv(5_000)
    }
}

impl fmt::Display for VoltageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} nV, {} nV]", self.min_nv, self.max_nv)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelConfig {
    pub channel: Channel,
    pub enabled: bool,
    pub coupling: Coupling,
    pub range: VoltageRange,
    /// Analogue offset in millivolts.
    pub offset_mv: f64,
    pub probe: ProbeAttenuation,
    pub bandwidth: BandwidthLimit,
}

impl ChannelConfig {
    /// An enabled channel with DC coupling, ±5 V range and a 1X probe.
    pub fn on(channel: Channel) -> Self {
        Self {
            channel,
            enabled: true,
            coupling: Coupling::default(),
            range: VoltageRange::default(),
            offset_mv: 0.0,
            probe: ProbeAttenuation::default(),
            bandwidth: BandwidthLimit::default(),
        }
    }

    pub fn off(channel: Channel) -> Self {
        Self {
            enabled: false,
            ..Self::on(channel)
        }
    }

    pub fn coupling(mut self, coupling: Coupling) -> Self {
        self.coupling = coupling;
        self
    }

    pub fn range(mut self, range: VoltageRange) -> Self {
        self.range = range;
        self
    }

    pub fn offset_mv(mut self, offset_mv: f64) -> Self {
        self.offset_mv = offset_mv;
        self
    }

    pub fn probe(mut self, probe: ProbeAttenuation) -> Self {
        self.probe = probe;
        self
    }

    pub fn bandwidth(mut self, bandwidth: BandwidthLimit) -> Self {
        self.bandwidth = bandwidth;
        self
    }
}
