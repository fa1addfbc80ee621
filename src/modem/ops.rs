//! Multi-step modem procedures built on the command bus.
//!
//! Band and cell locks require the radio to be switched off while the new
//! restriction is applied. Each step waits [`SETTLE_DELAY`] before the next
//! one is sent.

use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::command_bus::{CommandBus, CommandError, SETTLE_DELAY};

const RADIO_OFF: &str = "AT+SFUN=5";
const RADIO_ON: &str = "AT+SFUN=4";
const REACTIVATE_DATA: &str = "AT+CGACT=0,1";

/// Radio access technology a band or cell belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rat {
    Lte,
    Nr,
}

impl Rat {
    /// Selector used by `AT+SPFORCEFRQ`.
    fn force_frequency_selector(self) -> u8 {
        match self {
            Self::Lte => 12,
            Self::Nr => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duplex {
    Tdd,
    Fdd,
}

/// Bands the modem can be locked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Band {
    Tdd34,
    Tdd38,
    Tdd39,
    Tdd40,
    Tdd41,
    Fdd01,
    Fdd03,
    Fdd05,
    Fdd08,
    N01,
    N08,
    N28,
    N41,
    N77,
    N78,
    N79,
}

impl Band {
    pub const ALL: [Band; 16] = [
        Band::Tdd34,
        Band::Tdd38,
        Band::Tdd39,
        Band::Tdd40,
        Band::Tdd41,
        Band::Fdd01,
        Band::Fdd03,
        Band::Fdd05,
        Band::Fdd08,
        Band::N01,
        Band::N08,
        Band::N28,
        Band::N41,
        Band::N77,
        Band::N78,
        Band::N79,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Band::Tdd34 => "TDD_34",
            Band::Tdd38 => "TDD_38",
            Band::Tdd39 => "TDD_39",
            Band::Tdd40 => "TDD_40",
            Band::Tdd41 => "TDD_41",
            Band::Fdd01 => "FDD_01",
            Band::Fdd03 => "FDD_03",
            Band::Fdd05 => "FDD_05",
            Band::Fdd08 => "FDD_08",
            Band::N01 => "N01",
            Band::N08 => "N08",
            Band::N28 => "N28",
            Band::N41 => "N41",
            Band::N77 => "N77",
            Band::N78 => "N78",
            Band::N79 => "N79",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|band| band.name().eq_ignore_ascii_case(name))
    }

    pub fn rat(self) -> Rat {
        match self {
            Band::Tdd34
            | Band::Tdd38
            | Band::Tdd39
            | Band::Tdd40
            | Band::Tdd41
            | Band::Fdd01
            | Band::Fdd03
            | Band::Fdd05
            | Band::Fdd08 => Rat::Lte,
            _ => Rat::Nr,
        }
    }

    pub fn duplex(self) -> Duplex {
        match self {
            Band::Tdd34
            | Band::Tdd38
            | Band::Tdd39
            | Band::Tdd40
            | Band::Tdd41
            | Band::N41
            | Band::N77
            | Band::N78
            | Band::N79 => Duplex::Tdd,
            _ => Duplex::Fdd,
        }
    }

    /// Bit of this band inside its `AT+SPLBAND` mask.
    pub fn mask(self) -> u32 {
        match self {
            Band::Tdd34 => 2,
            Band::Tdd38 => 32,
            Band::Tdd39 => 64,
            Band::Tdd40 => 128,
            Band::Tdd41 => 256,
            Band::Fdd01 => 1,
            Band::Fdd03 => 4,
            Band::Fdd05 => 16,
            Band::Fdd08 => 128,
            Band::N01 => 1,
            Band::N08 => 128,
            Band::N28 => 512,
            Band::N41 => 16,
            Band::N77 => 128,
            Band::N78 => 256,
            Band::N79 => 512,
        }
    }
}

/// Lock bitmasks per technology and duplex mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BandMasks {
    pub lte_tdd: u32,
    pub lte_fdd: u32,
    pub nr_tdd: u32,
    pub nr_fdd: u32,
}

impl BandMasks {
    pub fn from_bands(bands: &[Band]) -> Self {
        bands.iter().fold(Self::default(), |mut masks, band| {
            let slot = match (band.rat(), band.duplex()) {
                (Rat::Lte, Duplex::Tdd) => &mut masks.lte_tdd,
                (Rat::Lte, Duplex::Fdd) => &mut masks.lte_fdd,
                (Rat::Nr, Duplex::Tdd) => &mut masks.nr_tdd,
                (Rat::Nr, Duplex::Fdd) => &mut masks.nr_fdd,
            };
            *slot |= band.mask();
            masks
        })
    }

    pub fn has_lte(&self) -> bool {
        self.lte_tdd != 0 || self.lte_fdd != 0
    }

    pub fn has_nr(&self) -> bool {
        self.nr_tdd != 0 || self.nr_fdd != 0
    }

    pub fn contains(&self, band: Band) -> bool {
        let mask = match (band.rat(), band.duplex()) {
            (Rat::Lte, Duplex::Tdd) => self.lte_tdd,
            (Rat::Lte, Duplex::Fdd) => self.lte_fdd,
            (Rat::Nr, Duplex::Tdd) => self.nr_tdd,
            (Rat::Nr, Duplex::Fdd) => self.nr_fdd,
        };
        mask & band.mask() != 0
    }

    pub fn locked_bands(&self) -> Vec<Band> {
        Band::ALL
            .into_iter()
            .filter(|band| self.contains(*band))
            .collect()
    }
}

/// Fields of the `+SPLBAND:` line in a response.
fn splband_fields(response: &str) -> Option<Vec<u32>> {
    let line = response
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("+SPLBAND:"))?;

    line.trim_start_matches("+SPLBAND:")
        .split(',')
        .map(|field| field.trim().parse::<u32>().ok())
        .collect()
}

/// Parses `+SPLBAND: 0,<tdd>,0,<fdd>,0` into (tdd, fdd).
pub fn parse_lte_lock(response: &str) -> Option<(u32, u32)> {
    let fields = splband_fields(response)?;
    Some((*fields.get(1)?, *fields.get(3)?))
}

/// Parses `+SPLBAND: <fdd>,0,<tdd>,0` into (tdd, fdd).
pub fn parse_nr_lock(response: &str) -> Option<(u32, u32)> {
    let fields = splband_fields(response)?;
    Some((*fields.get(2)?, *fields.first()?))
}

async fn step(bus: &CommandBus, command: &str) -> Result<String, CommandError> {
    let response = bus.execute_text(command).await;
    tokio::time::sleep(SETTLE_DELAY).await;
    response
}

/// Runs `body` with the radio switched off, then restores radio and data.
///
/// A failed radio-off aborts the sequence. Once the radio is off, radio-on
/// and data reactivation are always attempted; the first error is returned.
async fn with_radio_off(bus: &CommandBus, body: &[String]) -> Result<(), CommandError> {
    step(bus, RADIO_OFF).await?;

    let mut first_error = None;
    for command in body {
        if let Err(e) = step(bus, command).await {
            warn!("{command} failed: {e}");
            first_error = Some(e);
            break;
        }
    }

    let radio_on = step(bus, RADIO_ON).await.map(drop);
    let reactivate = bus.execute_text(REACTIVATE_DATA).await.map(drop);

    first_error.map_or(Ok(()), Err).and(radio_on).and(reactivate)
}

/// Restricts the modem to the given bands. An empty list removes all locks.
pub async fn lock_bands(bus: &CommandBus, bands: &[Band]) -> Result<(), CommandError> {
    if bands.is_empty() {
        return unlock_bands(bus).await;
    }

    let masks = BandMasks::from_bands(bands);
    let mut body = vec!["AT+SPLBAND=2,0,0,0,0".to_string()];
    if masks.has_lte() {
        body.push(format!(
            "AT+SPLBAND=1,0,{},0,{},0",
            masks.lte_tdd, masks.lte_fdd
        ));
    }
    if masks.has_nr() {
        body.push(format!("AT+SPLBAND=2,{},0,{},0", masks.nr_fdd, masks.nr_tdd));
    }

    with_radio_off(bus, &body).await?;
    info!("Band lock applied: {masks:?}");
    Ok(())
}

pub async fn unlock_bands(bus: &CommandBus) -> Result<(), CommandError> {
    let body = [
        "AT+SPLBAND=1,0,0,0,0,0".to_string(),
        "AT+SPLBAND=2,0,0,0,0".to_string(),
    ];
    with_radio_off(bus, &body).await?;
    info!("Band locks removed");
    Ok(())
}

/// Reads the active LTE and NR band locks.
pub async fn query_bands(bus: &CommandBus) -> Result<BandMasks, CommandError> {
    let lte = step(bus, "AT+SPLBAND=0").await?;
    let nr = bus.execute_text("AT+SPLBAND=3").await?;

    let (lte_tdd, lte_fdd) = parse_lte_lock(&lte)
        .ok_or_else(|| CommandError::Rpc(format!("unparsable LTE band response: {lte}")))?;
    let (nr_tdd, nr_fdd) = parse_nr_lock(&nr)
        .ok_or_else(|| CommandError::Rpc(format!("unparsable NR band response: {nr}")))?;

    Ok(BandMasks {
        lte_tdd,
        lte_fdd,
        nr_tdd,
        nr_fdd,
    })
}

/// Pins the modem to one cell given by frequency and physical cell id.
pub async fn lock_cell(bus: &CommandBus, rat: Rat, arfcn: u32, pci: u16) -> Result<(), CommandError> {
    let body = [
        "AT+SPFORCEFRQ=12,0".to_string(),
        "AT+SPFORCEFRQ=16,0".to_string(),
        format!(
            "AT+SPFORCEFRQ={},2,{arfcn},{pci}",
            rat.force_frequency_selector()
        ),
    ];
    with_radio_off(bus, &body).await?;
    info!("Cell lock applied: {rat:?} arfcn={arfcn} pci={pci}");
    Ok(())
}

pub async fn unlock_cell(bus: &CommandBus) -> Result<(), CommandError> {
    let body = [
        "AT+SPFORCEFRQ=12,0".to_string(),
        "AT+SPFORCEFRQ=16,0".to_string(),
    ];
    with_radio_off(bus, &body).await?;
    info!("Cell lock removed");
    Ok(())
}
