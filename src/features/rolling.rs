//! Скользящие вычисления над упорядоченной по времени последовательностью одного мерчанта.
//!
//! Все функции принимают срез значений (уже отсортированный по месяцу) и размер окна,
//! и не зависят от группировки: вызываются одинаково и внутри движков, и отдельно.
//! Окно: последние `w` наблюдений, включая текущее; будущие значения не используются.

/// Приведение вырожденного результата (NaN, ±inf) к None
pub fn finite(value: f64) -> Option<f64> {
    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}

/// Деление с нулевым знаменателем -> None
pub fn safe_div(numerator: Option<f64>, denominator: Option<f64>) -> Option<f64> {
    match (numerator, denominator) {
        (Some(n), Some(d)) if d != 0.0 => finite(n / d),
        _ => None,
    }
}

fn window(values: &[Option<f64>], end: usize, size: usize) -> &[Option<f64>] {
    let start = (end + 1).saturating_sub(size);
    &values[start..=end]
}

fn present(values: &[Option<f64>]) -> impl Iterator<Item = f64> + '_ {
    values.iter().flatten().copied()
}

/// Значение `k` наблюдений назад
pub fn lag(values: &[Option<f64>], k: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| if i >= k { values[i - k] } else { None })
        .collect()
}

/// Разность с наблюдением `k` шагов назад
pub fn diff(values: &[Option<f64>], k: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| match (i >= k).then(|| (values[i], values[i - k])) {
            Some((Some(current), Some(previous))) => finite(current - previous),
            _ => None,
        })
        .collect()
}

/// Процентное изменение к значению `k` наблюдений назад
pub fn pct_change(values: &[Option<f64>], k: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            if i < k {
                return None;
            }
            match (values[i], values[i - k]) {
                (Some(current), Some(previous)) if previous != 0.0 => {
                    finite((current - previous) / previous * 100.0)
                }
                _ => None,
            }
        })
        .collect()
}

/// Скользящее среднее; достаточно одного непустого значения в окне
pub fn rolling_mean(values: &[Option<f64>], size: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| mean(window(values, i, size)))
        .collect()
}

/// Скользящая сумма; пустое окно -> None
pub fn rolling_sum(values: &[Option<f64>], size: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            let win = window(values, i, size);
            if win.iter().all(Option::is_none) {
                None
            } else {
                Some(present(win).sum())
            }
        })
        .collect()
}

/// Скользящее выборочное стандартное отклонение (ddof = 1); нужно минимум два значения
pub fn rolling_std(values: &[Option<f64>], size: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| sample_std(window(values, i, size)))
        .collect()
}

/// Коэффициент вариации std / mean; нулевое среднее -> None
pub fn coefficient_of_variation(std: &[Option<f64>], mean: &[Option<f64>]) -> Vec<Option<f64>> {
    std.iter()
        .zip(mean.iter())
        .map(|(&s, &m)| safe_div(s, m))
        .collect()
}

/// Скользящий наклон МНК по локальному окну
pub fn rolling_slope(values: &[Option<f64>], size: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| ols_slope(window(values, i, size)))
        .collect()
}

pub fn mean(values: &[Option<f64>]) -> Option<f64> {
    let (sum, count) = present(values).fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        None
    } else {
        finite(sum / count as f64)
    }
}

pub fn sample_std(values: &[Option<f64>]) -> Option<f64> {
    let points: Vec<f64> = present(values).collect();
    if points.len() < 2 {
        return None;
    }
    let mean = points.iter().sum::<f64>() / points.len() as f64;
    let variance = points.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (points.len() - 1) as f64;
    finite(variance.sqrt())
}

/// Наклон прямой МНК для значений против индекса 0..n-1.
/// Пропуски исключаются, но индексы остальных точек сохраняются. Меньше двух точек -> None.
pub fn ols_slope(values: &[Option<f64>]) -> Option<f64> {
    let points: Vec<(f64, f64)> = values
        .iter()
        .enumerate()
        .filter_map(|(x, y)| y.map(|y| (x as f64, y)))
        .collect();
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let (sxy, sxx) = points.iter().fold((0.0, 0.0), |(sxy, sxx), (x, y)| {
        let dx = x - mean_x;
        (sxy + dx * (y - mean_y), sxx + dx * dx)
    });
    if sxx == 0.0 {
        return None;
    }
    finite(sxy / sxx)
}

/// Накопленный максимум; пропуск остаётся пропуском, но не сбрасывает максимум
pub fn cumulative_max(values: &[Option<f64>]) -> Vec<Option<f64>> {
    cumulative(values, f64::max)
}

pub fn cumulative_min(values: &[Option<f64>]) -> Vec<Option<f64>> {
    cumulative(values, f64::min)
}

fn cumulative(values: &[Option<f64>], pick: fn(f64, f64) -> f64) -> Vec<Option<f64>> {
    let mut running: Option<f64> = None;
    values
        .iter()
        .map(|value| {
            let v = (*value)?;
            let next = running.map_or(v, |r| pick(r, v));
            running = Some(next);
            Some(next)
        })
        .collect()
}

/// Длина текущей серии подряд идущих `true`; любое `false` сбрасывает счётчик
pub fn run_length(flags: &[bool]) -> Vec<u32> {
    let mut current = 0u32;
    flags
        .iter()
        .map(|&flag| {
            current = if flag { current + 1 } else { 0 };
            current
        })
        .collect()
}

/// Непустые значения по возрастанию
fn sorted_present(values: &[Option<f64>]) -> Vec<f64> {
    let mut sorted: Vec<f64> = present(values).collect();
    sorted.sort_by(f64::total_cmp);
    sorted
}

/// Ранг по убыванию с методом "min": равные значения получают наименьший ранг группы.
/// Пропуски не ранжируются.
pub fn rank_descending_min(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let sorted = sorted_present(values);
    values
        .iter()
        .map(|value| {
            value.map(|v| {
                let not_greater = sorted.partition_point(|&other| other <= v);
                1.0 + (sorted.len() - not_greater) as f64
            })
        })
        .collect()
}

/// Процентильный ранг 0-100 по возрастанию, равные значения получают средний ранг
pub fn percentile_rank(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let sorted = sorted_present(values);
    let n = sorted.len() as f64;
    values
        .iter()
        .map(|value| {
            value.map(|v| {
                let below = sorted.partition_point(|&other| other < v);
                let equal = sorted.partition_point(|&other| other <= v) - below;
                (below as f64 + (equal as f64 + 1.0) / 2.0) / n * 100.0
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().copied().map(Some).collect()
    }

    fn assert_close(actual: Option<f64>, expected: f64) {
        let actual = actual.expect("expected a value");
        assert!((actual - expected).abs() < 1e-9, "{actual} != {expected}");
    }

    #[test]
    fn lag_is_null_for_short_history() {
        let values = some(&[1.0, 2.0, 3.0]);
        assert_eq!(lag(&values, 1), vec![None, Some(1.0), Some(2.0)]);
        assert_eq!(lag(&values, 3), vec![None, None, None]);
    }

    #[test]
    fn moving_average_of_three_months() {
        let values = some(&[10.0, 20.0, 30.0]);
        let ma = rolling_mean(&values, 3);
        assert_close(ma[0], 10.0);
        assert_close(ma[1], 15.0);
        assert_close(ma[2], 20.0);
    }

    #[test]
    fn moving_average_skips_nulls() {
        let values = vec![Some(4.0), None, Some(8.0)];
        assert_close(rolling_mean(&values, 3)[2], 6.0);
        assert_eq!(rolling_mean(&[None], 3), vec![None]);
    }

    #[test]
    fn change_rate_normalizes_division_by_zero() {
        let values = some(&[0.0, 10.0, 15.0]);
        let change = pct_change(&values, 1);
        assert_eq!(change[0], None);
        assert_eq!(change[1], None);
        assert_close(change[2], 50.0);
    }

    #[test]
    fn trend_of_arithmetic_series_equals_step() {
        let values = some(&[3.0, 5.5, 8.0, 10.5, 13.0, 15.5]);
        for w in [2, 3, 6] {
            let slopes = rolling_slope(&values, w);
            assert_eq!(slopes[0], None);
            for slope in &slopes[1..] {
                assert_close(*slope, 2.5);
            }
        }
    }

    #[test]
    fn trend_is_local_per_window() {
        // рост, затем падение: наклон последнего окна отрицательный
        let values = some(&[1.0, 2.0, 3.0, 2.0, 1.0]);
        let slopes = rolling_slope(&values, 3);
        assert_close(slopes[2], 1.0);
        assert_close(slopes[4], -1.0);
    }

    #[test]
    fn trend_keeps_positions_of_missing_points() {
        let values = vec![Some(0.0), None, Some(4.0)];
        assert_close(ols_slope(&values), 2.0);
        assert_eq!(ols_slope(&[None, Some(1.0)]), None);
    }

    #[test]
    fn std_needs_two_points_and_cv_drops_zero_mean() {
        let values = some(&[2.0, 4.0]);
        let std = rolling_std(&values, 3);
        assert_eq!(std[0], None);
        assert_close(std[1], 2f64.sqrt());

        let cv = coefficient_of_variation(&[Some(1.0), Some(1.0)], &[Some(0.0), Some(2.0)]);
        assert_eq!(cv[0], None);
        assert_close(cv[1], 0.5);
    }

    #[test]
    fn rank_ties_share_minimum() {
        let values = some(&[50.0, 50.0, 50.0, 10.0, 90.0]);
        let ranks = rank_descending_min(&values);
        assert_eq!(ranks, some(&[2.0, 2.0, 2.0, 5.0, 1.0]));
    }

    #[test]
    fn rank_after_tie_group_is_tie_count_plus_one() {
        let values = vec![Some(7.0), Some(7.0), Some(7.0), Some(3.0), None];
        let ranks = rank_descending_min(&values);
        assert_eq!(ranks[3], Some(4.0));
        assert_eq!(ranks[4], None);
    }

    #[test]
    fn percentile_rank_ascending_average() {
        let pct = percentile_rank(&some(&[1.0, 2.0, 2.0, 3.0]));
        assert_close(pct[0], 25.0);
        assert_close(pct[1], 62.5);
        assert_close(pct[3], 100.0);
    }

    #[test]
    fn ranks_on_unsorted_month_with_repeated_values() {
        // 50 уровней по 4 мерчанта вперемешку, плюс пропуск
        let mut values: Vec<Option<f64>> = (0..200).map(|i| Some(((i * 7) % 50) as f64)).collect();
        values.push(None);

        let ranks = rank_descending_min(&values);
        let pct = percentile_rank(&values);
        for (value, (rank, p)) in values.iter().zip(ranks.iter().zip(pct.iter())) {
            match value {
                Some(v) => {
                    assert_close(*rank, 1.0 + 4.0 * (49.0 - v));
                    assert_close(*p, (4.0 * v + 2.5) / 200.0 * 100.0);
                }
                None => assert!(rank.is_none() && p.is_none()),
            }
        }
    }

    #[test]
    fn run_length_resets() {
        assert_eq!(
            run_length(&[true, true, false, true, true, true, false]),
            vec![1, 2, 0, 1, 2, 3, 0]
        );
    }

    #[test]
    fn cumulative_extremes_ignore_gaps() {
        let values = vec![Some(3.0), None, Some(5.0), Some(2.0)];
        assert_eq!(cumulative_max(&values), vec![Some(3.0), None, Some(5.0), Some(5.0)]);
        assert_eq!(cumulative_min(&values), vec![Some(3.0), None, Some(3.0), Some(2.0)]);
    }

    #[test]
    fn diff_over_period() {
        let values = some(&[1.0, 4.0, 2.0]);
        assert_eq!(diff(&values, 1), vec![None, Some(3.0), Some(-2.0)]);
        assert_eq!(diff(&values, 2), vec![None, None, Some(1.0)]);
    }
}
