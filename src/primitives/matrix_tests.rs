pub(crate) use super::*;

#[test]
fn test_from_vec() {
    let m = Matrix::from_vec(2, 3, vec![1.0_f32, 2.0, 3.0, 4.0, 5.0, 6.0])
        .expect("test data has correct dimensions: 2*3=6 elements");
    assert_eq!(m.shape(), (2, 3));
    assert!((m.get(0, 0) - 1.0).abs() < 1e-6);
    assert!((m.get(1, 2) - 6.0).abs() < 1e-6);
}

#[test]
fn test_from_vec_error() {
    let result = Matrix::from_vec(2, 3, vec![1.0_f32, 2.0, 3.0]);
    assert!(matches!(result, Err(WardenError::DimensionMismatch { .. })));
}

#[test]
fn test_from_rows() {
    let m = Matrix::from_rows(&[vec![1.0_f32, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]])
        .expect("rows have equal length");
    assert_eq!(m.shape(), (3, 2));
    assert_eq!(m.row(2), &[5.0, 6.0]);
}

#[test]
fn test_from_rows_ragged() {
    let result = Matrix::from_rows(&[vec![1.0_f32, 2.0], vec![3.0]]);
    assert!(result.is_err());
    assert!(Matrix::<f32>::from_rows(&[]).is_err());
}

#[test]
fn test_transpose() {
    let m = Matrix::from_vec(2, 3, vec![1.0_f32, 2.0, 3.0, 4.0, 5.0, 6.0])
        .expect("test data has correct dimensions: 2*3=6 elements");
    let t = m.transpose();
    assert_eq!(t.shape(), (3, 2));
    assert!((t.get(0, 1) - 4.0).abs() < 1e-6);
    assert!((t.get(2, 1) - 6.0).abs() < 1e-6);
    assert_eq!(t.transpose(), m);
}

#[test]
fn test_rows_iter() {
    let m = Matrix::from_vec(2, 2, vec![1.0_f32, 2.0, 3.0, 4.0]).expect("2x2");
    let rows: Vec<&[f32]> = m.rows().collect();
    assert_eq!(rows, vec![&[1.0, 2.0][..], &[3.0, 4.0][..]]);
    assert_eq!(Matrix::zeros(3, 0).rows().count(), 0);
}

#[test]
fn test_matmul() {
    // 2x3 * 3x2 = 2x2
    let a = Matrix::from_vec(2, 3, vec![1.0_f32, 2.0, 3.0, 4.0, 5.0, 6.0])
        .expect("test data has correct dimensions: 2*3=6 elements");
    let b = Matrix::from_vec(3, 2, vec![7.0_f32, 8.0, 9.0, 10.0, 11.0, 12.0])
        .expect("test data has correct dimensions: 3*2=6 elements");
    let c = a
        .matmul(&b)
        .expect("matrix dimensions are compatible for multiplication: 2x3 * 3x2");

    assert_eq!(c.shape(), (2, 2));
    // c[0,0] = 1*7 + 2*9 + 3*11 = 58
    assert!((c.get(0, 0) - 58.0).abs() < 1e-6);
    // c[1,1] = 4*8 + 5*10 + 6*12 = 154
    assert!((c.get(1, 1) - 154.0).abs() < 1e-6);
}

#[test]
fn test_matmul_dimension_error() {
    let a = Matrix::from_vec(2, 3, vec![1.0_f32; 6]).expect("2x3");
    let b = Matrix::from_vec(2, 2, vec![1.0_f32; 4]).expect("2x2");
    assert!(a.matmul(&b).is_err());
}

#[test]
fn test_select_and_slice_rows() {
    let m = Matrix::from_vec(3, 2, vec![1.0_f32, 2.0, 3.0, 4.0, 5.0, 6.0]).expect("3x2");
    let picked = m.select_rows(&[2, 0]);
    assert_eq!(picked.as_slice(), &[5.0, 6.0, 1.0, 2.0]);
    let tail = m.slice_rows(1, 3);
    assert_eq!(tail.shape(), (2, 2));
    assert_eq!(tail.row(0), &[3.0, 4.0]);
}

#[test]
fn test_vstack() {
    let a = Matrix::from_vec(1, 2, vec![1.0_f32, 2.0]).expect("1x2");
    let b = Matrix::from_vec(2, 2, vec![3.0_f32, 4.0, 5.0, 6.0]).expect("2x2");
    let stacked = Matrix::vstack(&[a.clone(), b]).expect("same width");
    assert_eq!(stacked.shape(), (3, 2));
    assert_eq!(stacked.row(2), &[5.0, 6.0]);

    let wide = Matrix::zeros(1, 3);
    assert!(Matrix::vstack(&[a, wide]).is_err());
}

#[test]
fn test_mul_scalar_and_map() {
    let m = Matrix::from_vec(2, 2, vec![1.0_f32, -2.0, 3.0, -4.0]).expect("2x2");
    assert!((m.mul_scalar(2.0).get(1, 1) + 8.0).abs() < 1e-6);
    assert_eq!(m.map(|x| x.max(0.0)).as_slice(), &[1.0, 0.0, 3.0, 0.0]);
}

#[test]
fn test_is_finite() {
    let mut m = Matrix::zeros(2, 2);
    assert!(m.is_finite());
    m.set(0, 1, f32::NAN);
    assert!(!m.is_finite());
}
