/// Filtros para la detección de picos
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakParams {
    /// Altura mínima del pico
    pub min_height: f64,
    /// Prominencia mínima respecto a la base más alta de ambos lados
    pub min_prominence: f64,
}

/// Encuentra los máximos locales de `x` que superan la altura y la
/// prominencia mínimas. Las mesetas cuentan como un único pico en su punto
/// medio (redondeado hacia abajo). Devuelve índices en orden creciente.
pub fn find_peaks(x: &[f64], params: PeakParams) -> Vec<usize> {
    local_maxima(x)
        .into_iter()
        .filter(|&p| x[p] >= params.min_height)
        .filter(|&p| prominence(x, p) >= params.min_prominence)
        .collect()
}

/// Picos de `-x`: los valles de la señal
pub fn find_valleys(x: &[f64], params: PeakParams) -> Vec<usize> {
    let inverted: Vec<f64> = x.iter().map(|v| -v).collect();
    find_peaks(&inverted, params)
}

fn local_maxima(x: &[f64]) -> Vec<usize> {
    let mut peaks = Vec::new();
    if x.len() < 3 {
        return peaks;
    }

    let i_max = x.len() - 1;
    let mut i = 1;
    while i < i_max {
        if x[i - 1] < x[i] {
            // Avanzar por una posible meseta
            let mut ahead = i + 1;
            while ahead < i_max && x[ahead] == x[i] {
                ahead += 1;
            }
            if x[ahead] < x[i] {
                peaks.push((i + ahead - 1) / 2);
                i = ahead;
            }
        }
        i += 1;
    }
    peaks
}

/// Prominencia: altura del pico sobre la mayor de las dos bases, buscando a
/// cada lado hasta encontrar un valor más alto o el borde de la señal
fn prominence(x: &[f64], peak: usize) -> f64 {
    let height = x[peak];

    let mut left_min = height;
    for &v in x[..=peak].iter().rev() {
        if v > height {
            break;
        }
        left_min = left_min.min(v);
    }

    let mut right_min = height;
    for &v in &x[peak..] {
        if v > height {
            break;
        }
        right_min = right_min.min(v);
    }

    height - left_min.max(right_min)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT: PeakParams = PeakParams {
        min_height: 10.0,
        min_prominence: 10.0,
    };

    /// Pulso triangular de `amplitude` centrado en `center`
    fn bump(x: &mut [f64], center: usize, half_width: usize, amplitude: f64) {
        for i in center.saturating_sub(half_width)..=(center + half_width).min(x.len() - 1) {
            let dist = (i as f64 - center as f64).abs();
            x[i] += amplitude * (1.0 - dist / half_width as f64);
        }
    }

    #[test]
    fn test_simple_peak_and_valley() {
        let mut x = vec![0.0; 200];
        bump(&mut x, 50, 10, 42.0);
        bump(&mut x, 80, 10, -55.0);

        assert_eq!(find_peaks(&x, DEFAULT), vec![50]);
        assert_eq!(find_valleys(&x, DEFAULT), vec![80]);
    }

    #[test]
    fn test_height_filter() {
        let mut x = vec![0.0; 100];
        bump(&mut x, 30, 5, 8.0);
        bump(&mut x, 60, 5, 25.0);
        assert_eq!(find_peaks(&x, DEFAULT), vec![60]);
    }

    #[test]
    fn test_prominence_filter_rejects_ripple_on_plateau() {
        // Ondulación de 2 N sobre un escalón de 30 N: solo el máximo global es prominente
        let mut x = vec![0.0; 100];
        for v in x.iter_mut().take(80).skip(20) {
            *v = 30.0;
        }
        x[40] = 32.0;
        x[41] = 30.0;
        x[60] = 35.0;
        let peaks = find_peaks(&x, DEFAULT);
        assert_eq!(peaks, vec![60]);
    }

    #[test]
    fn test_plateau_midpoint() {
        let x = vec![0.0, 0.0, 20.0, 20.0, 20.0, 20.0, 0.0, 0.0];
        assert_eq!(find_peaks(&x, DEFAULT), vec![3]);
    }

    #[test]
    fn test_edges_are_not_peaks() {
        let x = vec![50.0, 0.0, 0.0, 0.0, 50.0];
        assert!(find_peaks(&x, DEFAULT).is_empty());
        assert!(find_peaks(&[1.0, 2.0], DEFAULT).is_empty());
    }
}
