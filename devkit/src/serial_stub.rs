/*!
Lien série simulé pour développement sans compteur

Répond à chaque commande avec la prochaine réponse scriptée, puis avec la
trame par défaut quand le script est vide. Toutes les commandes écrites sont
enregistrées pour les assertions.
*/

use powermon_collector::protocol::{crc16, RESPONSE_LEN};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

/// Réponse scriptée à une commande
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Frame(Vec<u8>),
    /// Le compteur ne répond pas: lecture en timeout
    Silence,
}

#[derive(Debug, Default)]
struct LinkState {
    script: VecDeque<ScriptedReply>,
    default_frame: Option<Vec<u8>>,
    pending: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
}

/// Handle partagé: un clone va dans le `DeviceReader`, l'autre reste au test
#[derive(Debug, Clone, Default)]
pub struct MockSerialLink {
    state: Arc<Mutex<LinkState>>,
}

impl MockSerialLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compteur sain qui répond toujours la même trame
    pub fn healthy() -> Self {
        let link = Self::new();
        link.set_default_frame(Some(MeterFrameBuilder::new().build()));
        link
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_default_frame(&self, frame: Option<Vec<u8>>) {
        self.lock().default_frame = frame;
    }

    pub fn push_frame(&self, frame: Vec<u8>) -> &Self {
        self.lock().script.push_back(ScriptedReply::Frame(frame));
        self
    }

    pub fn push_silence(&self) -> &Self {
        self.lock().script.push_back(ScriptedReply::Silence);
        self
    }

    /// Commandes reçues, dans l'ordre
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    pub fn request_count(&self) -> usize {
        self.lock().writes.len()
    }
}

impl Write for MockSerialLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        state.writes.push(buf.to_vec());

        let reply = state
            .script
            .pop_front()
            .or_else(|| state.default_frame.clone().map(ScriptedReply::Frame));
        state.pending = match reply {
            Some(ScriptedReply::Frame(frame)) => frame.into(),
            Some(ScriptedReply::Silence) | None => VecDeque::new(),
        };
        log::debug!("📤 [MOCK] serial command {:02X?}", buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for MockSerialLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.pending.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "mock meter did not answer"));
        }
        let n = buf.len().min(state.pending.len());
        for (slot, byte) in buf.iter_mut().zip(state.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

/// Construit une trame de réponse de 25 octets, mêmes unités que `Reading`
#[derive(Debug, Clone)]
pub struct MeterFrameBuilder {
    address: u8,
    voltage: f64,
    current: f64,
    power: f64,
    energy: f64,
    frequency: f64,
    power_factor: f64,
    alarm: bool,
}

impl Default for MeterFrameBuilder {
    fn default() -> Self {
        Self {
            address: 0x01,
            voltage: 230.0,
            current: 1.0,
            power: 230.0,
            energy: 1000.0,
            frequency: 50.0,
            power_factor: 1.0,
            alarm: false,
        }
    }
}

impl MeterFrameBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, address: u8) -> Self {
        self.address = address;
        self
    }

    pub fn voltage(mut self, volts: f64) -> Self {
        self.voltage = volts;
        self
    }

    pub fn current(mut self, amps: f64) -> Self {
        self.current = amps;
        self
    }

    pub fn power(mut self, watts: f64) -> Self {
        self.power = watts;
        self
    }

    pub fn energy(mut self, wh: f64) -> Self {
        self.energy = wh;
        self
    }

    pub fn frequency(mut self, hz: f64) -> Self {
        self.frequency = hz;
        self
    }

    pub fn power_factor(mut self, pf: f64) -> Self {
        self.power_factor = pf;
        self
    }

    pub fn alarm(mut self, alarm: bool) -> Self {
        self.alarm = alarm;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(RESPONSE_LEN);
        frame.extend_from_slice(&[self.address, 0x04, 0x14]);
        frame.extend_from_slice(&word(self.voltage * 10.0));
        frame.extend_from_slice(&low_word_first(self.current * 1000.0));
        frame.extend_from_slice(&low_word_first(self.power * 10.0));
        frame.extend_from_slice(&low_word_first(self.energy));
        frame.extend_from_slice(&word(self.frequency * 10.0));
        frame.extend_from_slice(&word(self.power_factor * 100.0));
        frame.extend_from_slice(if self.alarm { &[0xFF, 0xFF] } else { &[0x00, 0x00] });
        let crc = crc16(&frame).to_le_bytes();
        frame.extend_from_slice(&crc);
        frame
    }

    /// Trame valide puis un octet de charge utile inversé: CRC faux
    pub fn build_corrupted(&self) -> Vec<u8> {
        let mut frame = self.build();
        frame[4] ^= 0xFF;
        frame
    }
}

fn word(scaled: f64) -> [u8; 2] {
    (scaled.round() as u16).to_be_bytes()
}

/// Mot bas d'abord, chaque mot big-endian (particularité du compteur)
fn low_word_first(scaled: f64) -> [u8; 4] {
    let raw = scaled.round() as u32;
    let low = ((raw & 0xFFFF) as u16).to_be_bytes();
    let high = ((raw >> 16) as u16).to_be_bytes();
    [low[0], low[1], high[0], high[1]]
}
