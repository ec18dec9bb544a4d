use std::collections::VecDeque;

use crate::types::Sample;

/// Centro de presión de una muestra. `Invalid` cuando la fuerza vertical no
/// alcanza el mínimo: los consumidores lo saltan en lugar de dividir por ~0
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cop {
    Valid { x: f64, y: f64 },
    Invalid,
}

impl Cop {
    pub fn is_valid(&self) -> bool {
        matches!(self, Cop::Valid { .. })
    }

    pub fn as_option(&self) -> Option<(f64, f64)> {
        match *self {
            Cop::Valid { x, y } => Some((x, y)),
            Cop::Invalid => None,
        }
    }
}

/// Calcula el centro de presión (m) a partir de fuerzas y momentos
///
/// CoPx = -(My + z·Fx) / Fz,  CoPy = (Mx - z·Fy) / Fz
pub fn compute_cop(fx: f64, fy: f64, fz: f64, mx: f64, my: f64, z_offset: f64, min_fz: f64) -> Cop {
    if !(fz > min_fz) {
        return Cop::Invalid;
    }
    let x = -(my + z_offset * fx) / fz;
    let y = (mx - z_offset * fy) / fz;
    Cop::Valid { x, y }
}

/// Parámetros físicos de la plataforma usados para el CoP
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Platform {
    pub z_offset: f64,
    pub minimum_vertical_force: f64,
}

impl Platform {
    pub fn new(z_offset: f64, minimum_vertical_force: f64) -> Self {
        Self {
            z_offset,
            minimum_vertical_force,
        }
    }

    pub fn cop(&self, sample: &Sample) -> Cop {
        compute_cop(
            sample.fx(),
            sample.fy(),
            sample.fz(),
            sample.mx(),
            sample.my(),
            self.z_offset,
            self.minimum_vertical_force,
        )
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::new(crate::types::Z_OFFSET, crate::types::MINIMUM_VERTICAL_FORCE)
    }
}

/// Buffer circular de capacidad fija; descarta la muestra más antigua al llenarse
pub struct RollingBuffer {
    buffer: VecDeque<Sample>,
    capacity: usize,
}

impl RollingBuffer {
    /// Crea un buffer para `capacity` muestras (segundos visibles × frecuencia)
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Añade una muestra al final
    pub fn push(&mut self, sample: Sample) {
        if self.capacity == 0 {
            return;
        }
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() == self.capacity
    }

    /// Muestras de la más antigua a la más reciente
    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.buffer.iter()
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.buffer.back()
    }

    /// Limpia el buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Media de una serie; `None` si está vacía
pub fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0usize;
    for v in values {
        sum += v;
        count += 1;
    }
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}
