//! Compute targets and the order in which the dispatcher tries them.
use std::fmt;
use std::str::FromStr;

use itertools::Itertools;
use kestrel_data::TVec;

use crate::errors::KestrelResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Backend {
    CpuReference,
    CpuNeon,
    CpuQuantized,
    GpuOpenCl,
    DspHexagon,
}

impl Backend {
    pub const ALL: [Backend; 5] = [
        Backend::CpuReference,
        Backend::CpuNeon,
        Backend::CpuQuantized,
        Backend::GpuOpenCl,
        Backend::DspHexagon,
    ];

    /// Where tensors produced by this backend's kernels live.
    pub fn location(&self) -> Location {
        match self {
            Backend::GpuOpenCl | Backend::DspHexagon => Location::Device(*self),
            _ => Location::Host,
        }
    }

    pub fn is_host(&self) -> bool {
        self.location() == Location::Host
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Backend::CpuReference => "reference",
            Backend::CpuNeon => "neon",
            Backend::CpuQuantized => "quantized",
            Backend::GpuOpenCl => "opencl",
            Backend::DspHexagon => "hexagon",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reference" | "cpu" | "ref" => Ok(Backend::CpuReference),
            "neon" => Ok(Backend::CpuNeon),
            "quantized" | "quantize" | "q8" => Ok(Backend::CpuQuantized),
            "opencl" | "gpu" => Ok(Backend::GpuOpenCl),
            "hexagon" | "dsp" => Ok(Backend::DspHexagon),
            _ => anyhow::bail!("Unknown backend {:?}", s),
        }
    }
}

/// Memory space holding a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Host,
    Device(Backend),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Location::Host => write!(f, "host"),
            Location::Device(b) => write!(f, "{b} device"),
        }
    }
}

/// Ordered list of backends. Earlier entries win when several backends have
/// a kernel for the same operator.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BackendPreference(TVec<Backend>);

impl BackendPreference {
    /// Duplicates are dropped, keeping the first occurrence.
    pub fn new(backends: impl IntoIterator<Item = Backend>) -> BackendPreference {
        BackendPreference(backends.into_iter().unique().collect())
    }

    /// Host backends only, fastest first.
    pub fn cpu() -> BackendPreference {
        BackendPreference::new([Backend::CpuNeon, Backend::CpuQuantized, Backend::CpuReference])
    }

    pub fn only(backend: Backend) -> BackendPreference {
        BackendPreference::new([backend])
    }

    pub fn backends(&self) -> &[Backend] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = Backend> + '_ {
        self.0.iter().copied()
    }

    pub fn contains(&self, backend: Backend) -> bool {
        self.0.contains(&backend)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse a comma separated list, like `opencl,neon,reference`.
    pub fn parse(s: &str) -> KestrelResult<BackendPreference> {
        let backends = s
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(Backend::from_str)
            .collect::<KestrelResult<Vec<_>>>()?;
        anyhow::ensure!(!backends.is_empty(), "Empty backend preference {:?}", s);
        Ok(BackendPreference::new(backends))
    }
}

impl Default for BackendPreference {
    fn default() -> BackendPreference {
        BackendPreference::new([
            Backend::GpuOpenCl,
            Backend::DspHexagon,
            Backend::CpuNeon,
            Backend::CpuQuantized,
            Backend::CpuReference,
        ])
    }
}

impl FromIterator<Backend> for BackendPreference {
    fn from_iter<I: IntoIterator<Item = Backend>>(iter: I) -> Self {
        BackendPreference::new(iter)
    }
}

impl fmt::Debug for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}]", self.0.iter().join(" > "))
    }
}

impl fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.iter().join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_preference() {
        let p = BackendPreference::parse("opencl, neon,reference,neon").unwrap();
        assert_eq!(p.backends(), &[Backend::GpuOpenCl, Backend::CpuNeon, Backend::CpuReference]);
        assert_eq!(p.to_string(), "opencl,neon,reference");
    }

    #[test]
    fn parse_rejects_unknown() {
        assert!(BackendPreference::parse("tpu").is_err());
        assert!(BackendPreference::parse(" , ").is_err());
    }

    #[test]
    fn device_backends() {
        assert_eq!(Backend::GpuOpenCl.location(), Location::Device(Backend::GpuOpenCl));
        assert!(Backend::CpuQuantized.is_host());
        assert!(!Backend::DspHexagon.is_host());
    }
}
