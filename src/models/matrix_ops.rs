use faer::Mat;

/// `matrix[row, ..] · coef`.
#[must_use]
pub fn dot_row(matrix: &Mat<f64>, row: usize, coef: &[f64]) -> f64 {
    coef.iter()
        .enumerate()
        .map(|(j, value)| matrix[(row, j)] * value)
        .sum()
}

/// `X β` as a plain vector.
#[must_use]
pub fn linear_predictor(matrix: &Mat<f64>, coef: &[f64]) -> Vec<f64> {
    (0..matrix.nrows())
        .map(|row| dot_row(matrix, row, coef))
        .collect()
}

/// `X β` restricted to the listed rows; other entries are zero.
#[must_use]
pub fn linear_predictor_rows(matrix: &Mat<f64>, coef: &[f64], rows: &[usize]) -> Vec<f64> {
    let mut output = vec![0.0; matrix.nrows()];
    for &row in rows {
        output[row] = dot_row(matrix, row, coef);
    }
    output
}
