//! Bit packing of scratchpad images and router codes
//!
//! Bit layout of one transmission word, least significant bit first. Entry
//! `i` of a sub-stream lands in word `i / per_word` at offset
//! `(i % per_word) * entry_bits`.
//!
//! | port | sub-stream | entry                                  | entry bits | per 24/40-bit word |
//! |------|------------|----------------------------------------|------------|--------------------|
//! | iact | address    | end pointer of a line, in entries      | 4          | 6                  |
//! | iact | data       | `overflow << 8 \| value` (two's compl.) | 12         | 2                  |
//! | wght | address    | end pointer of a column, in words      | 7          | 3                  |
//! | wght | data       | `overflow << 8 \| value` (two's compl.) | 12         | 2                  |
//! | psum | data       | value (two's complement)               | 20         | 2                  |
//!
//! An image is sent as its address words followed by its data words, each
//! sub-stream zero-filled to the fixed length the status register announces.
//!
//! Router buses concatenate one code per lane at offset `lane * code_bits`.
//! The serial data word carries the activation payload in the low half and
//! the weight payload above `serial_split_bits`.

use serde::{Deserialize, Serialize};

use crate::error::{MapError, MapResult};
use crate::hardware::{
    decode_twos_complement, encode_signed_field, encode_unsigned_field, field_mask, AcceleratorConfig, Port,
};
use crate::stream::{DataWord, ScratchpadImage};

/// Little-endian bit vector wider than one machine word
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WideWord {
    bits: usize,
    limbs: Vec<u64>,
}

impl WideWord {
    pub fn zero(bits: usize) -> Self {
        Self {
            bits,
            limbs: vec![0; bits.div_ceil(64)],
        }
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    /// Write the low `width` bits of `value` at `offset`
    pub fn set_field(&mut self, offset: usize, width: u32, value: u64) {
        for i in 0..width as usize {
            let bit = offset + i;
            if bit >= self.bits {
                break;
            }
            let (limb, shift) = (bit / 64, bit % 64);
            if (value >> i) & 1 == 1 {
                self.limbs[limb] |= 1 << shift;
            } else {
                self.limbs[limb] &= !(1 << shift);
            }
        }
    }

    pub fn field(&self, offset: usize, width: u32) -> u64 {
        let mut value = 0;
        for i in 0..width as usize {
            let bit = offset + i;
            if bit >= self.bits {
                break;
            }
            value |= ((self.limbs[bit / 64] >> (bit % 64)) & 1) << i;
        }
        value
    }

    /// Split into `width`-bit words, lowest first
    pub fn chunks(&self, width: u32) -> Vec<u64> {
        let width_bits = width as usize;
        (0..self.bits.div_ceil(width_bits))
            .map(|i| self.field(i * width_bits, width))
            .collect()
    }

    /// Most significant bit first, zero padded to the full width
    pub fn to_binary_string(&self) -> String {
        (0..self.bits)
            .rev()
            .map(|bit| if self.field(bit, 1) == 1 { '1' } else { '0' })
            .collect()
    }
}

/// Pack raw entries `per_word` at a time into transmission words
pub fn pack_entries(entries: &[u64], entry_bits: u32, per_word: usize) -> Vec<u64> {
    entries
        .chunks(per_word)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u64, |word, (slot, &entry)| word | (entry << (slot as u32 * entry_bits)))
        })
        .collect()
}

/// Inverse of [`pack_entries`]: every slot of every word
pub fn unpack_entries(words: &[u64], entry_bits: u32, per_word: usize) -> Vec<u64> {
    words
        .iter()
        .flat_map(|&word| (0..per_word).map(move |slot| (word >> (slot as u32 * entry_bits)) & field_mask(entry_bits)))
        .collect()
}

/// Raw data entry of one value on `port`
pub fn data_entry(config: &AcceleratorConfig, port: Port, word: &DataWord) -> MapResult<u64> {
    let data_bits = port.data_bits(config);
    let value = encode_signed_field(&format!("{} data", port), word.value, data_bits)?;
    match port {
        Port::Psum => Ok(value),
        Port::Iact | Port::Wght => {
            let overflow = encode_unsigned_field(
                &format!("{} overflow count", port),
                word.overflow as usize,
                config.overflow_bits,
            )?;
            Ok((overflow << data_bits) | value)
        }
    }
}

/// Decode a raw data entry of `port`
pub fn decode_data_entry(config: &AcceleratorConfig, port: Port, raw: u64) -> DataWord {
    let data_bits = port.data_bits(config);
    let value = decode_twos_complement(raw, data_bits);
    let overflow = match port {
        Port::Psum => 0,
        Port::Iact | Port::Wght => ((raw >> data_bits) & field_mask(config.overflow_bits)) as u32,
    };
    DataWord { value, overflow }
}

/// Pack one image into `addr_words` address words followed by `data_words`
/// data words
pub fn pack_image(
    config: &AcceleratorConfig,
    port: Port,
    image: &ScratchpadImage,
    addr_words: usize,
    data_words: usize,
) -> MapResult<Vec<u64>> {
    let mut words = Vec::with_capacity(addr_words + data_words);

    if let Some(addr_bits) = port.addr_bits(config) {
        let addrs = image
            .addr_words
            .iter()
            .map(|&a| encode_unsigned_field(&format!("{} address", port), a, addr_bits))
            .collect::<MapResult<Vec<u64>>>()?;
        let packed = pack_entries(&addrs, addr_bits, port.addrs_per_trans(config));
        push_fixed(&mut words, packed, addr_words, port, "address")?;
    }

    let entries = image
        .data_words
        .iter()
        .map(|w| data_entry(config, port, w))
        .collect::<MapResult<Vec<u64>>>()?;
    let packed = pack_entries(&entries, port.entry_bits(config), port.values_per_trans(config));
    push_fixed(&mut words, packed, data_words, port, "data")?;
    Ok(words)
}

fn push_fixed(words: &mut Vec<u64>, packed: Vec<u64>, len: usize, port: Port, what: &str) -> MapResult<()> {
    if packed.len() > len {
        return Err(MapError::stream(format!(
            "{} {} needs {} words but the frame allows {}",
            port,
            what,
            packed.len(),
            len
        )));
    }
    let padding = len - packed.len();
    words.extend(packed);
    words.extend(std::iter::repeat(0).take(padding));
    Ok(())
}

/// Split the words of one packed image back into address entries and data
/// entries; the caller decides how many of them are meaningful
pub fn unpack_image(
    config: &AcceleratorConfig,
    port: Port,
    words: &[u64],
    addr_words: usize,
) -> (Vec<usize>, Vec<DataWord>) {
    let split = addr_words.min(words.len());
    let addrs = match port.addr_bits(config) {
        Some(bits) => unpack_entries(&words[..split], bits, port.addrs_per_trans(config))
            .into_iter()
            .map(|a| a as usize)
            .collect(),
        None => Vec::new(),
    };
    let data = unpack_entries(&words[split..], port.entry_bits(config), port.values_per_trans(config))
        .into_iter()
        .map(|raw| decode_data_entry(config, port, raw))
        .collect();
    (addrs, data)
}

/// Concatenate router codes of one port into its mode bus
pub fn pack_router_bus(config: &AcceleratorConfig, port: Port, codes: &[u8]) -> MapResult<WideWord> {
    let bits = port.router_bits(config);
    let mut bus = WideWord::zero(codes.len() * bits as usize);
    for (lane, &code) in codes.iter().enumerate() {
        let raw = encode_unsigned_field(&format!("{} router code", port), code as usize, bits)?;
        bus.set_field(lane * bits as usize, bits, raw);
    }
    Ok(bus)
}

/// Router codes of one port as serial DMA words, as many whole codes per
/// word as fit
pub fn router_dma_words(config: &AcceleratorConfig, port: Port, codes: &[u8]) -> MapResult<Vec<u64>> {
    let bits = port.router_bits(config);
    let per_word = (config.dma_bits / bits) as usize;
    let raw = codes
        .iter()
        .map(|&code| encode_unsigned_field(&format!("{} router code", port), code as usize, bits))
        .collect::<MapResult<Vec<u64>>>()?;
    Ok(pack_entries(&raw, bits, per_word))
}

/// One serial data word: activation payload low, weight payload above `split`
pub fn pack_serial_word(iact: u64, wght: u64, split: u32) -> u64 {
    iact | (wght << split)
}
