use nalgebra::{Matrix3, SMatrix};

use crate::utils::vectors::Vec3;
use crate::{FitError, FitResult, Float, PI};

/// Conversion factor between magnetic field and curvature,
/// `0.299792458 GeV / (T m)` expressed per centimeter. For a field of
/// `b` Tesla, a particle of unit charge and transverse momentum `pt` GeV
/// curves with `omega = b_field_over_c(b) / pt` per centimeter.
pub fn b_field_over_c(b_field: Float) -> Float {
    0.00299792458 * b_field
}

/// Perigee parameterization of a trajectory: the point of closest approach
/// (poca) to the z axis in the transverse plane.
///
/// `d0` is the transverse poca coordinate along `(-sin(phi0), cos(phi0))`,
/// `phi0` the momentum azimuth at the poca, `omega` the signed curvature
/// (1/cm, zero for a straight line), `z0` the z coordinate at the poca and
/// `tan_lambda` the longitudinal slope `pz/pt`. The poca position in the
/// transverse plane is `(-d0 sin(phi0), d0 cos(phi0))`.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct HelixParameters {
    pub d0: Float,
    pub phi0: Float,
    pub omega: Float,
    pub z0: Float,
    pub tan_lambda: Float,
}

impl HelixParameters {
    pub fn from_array(pars: [Float; 5]) -> Self {
        Self {
            d0: pars[0],
            phi0: pars[1],
            omega: pars[2],
            z0: pars[3],
            tan_lambda: pars[4],
        }
    }
    pub fn to_array(self) -> [Float; 5] {
        [self.d0, self.phi0, self.omega, self.z0, self.tan_lambda]
    }
    /// Center of the transverse circle (meaningless for `omega == 0`).
    fn center(&self) -> (Float, Float) {
        let r = self.d0 + 1.0 / self.omega;
        (-r * self.phi0.sin(), r * self.phi0.cos())
    }
}

/// A helix predicted from a production vertex, together with the signed flight
/// length from that vertex to the perigee (negative when the perigee lies
/// behind the vertex with respect to the momentum direction).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct VertexPrediction {
    pub helix: HelixParameters,
    pub flight_length: Float,
}

/// Map an angle onto `(-pi, pi]`.
pub fn wrap_angle(angle: Float) -> Float {
    let mut a = angle % (2.0 * PI);
    if a > PI {
        a -= 2.0 * PI;
    } else if a <= -PI {
        a += 2.0 * PI;
    }
    a
}

const MIN_PT: Float = 1e-9;
const MIN_CURVATURE: Float = 1e-12;

/// Predict the perigee helix of a particle produced at `position` with
/// `momentum`, for the given charge and solenoid field (Tesla, along z).
///
/// Neutral particles and zero field reduce to the straight-line limit.
pub fn helix_from_vertex(
    position: Vec3,
    momentum: Vec3,
    charge: i32,
    b_field: Float,
) -> FitResult<VertexPrediction> {
    let pt = momentum.perp();
    if !(pt > MIN_PT) {
        return Err(FitError::BadInput(
            "cannot build a helix from a momentum with no transverse component".to_string(),
        ));
    }
    let lambda = b_field_over_c(b_field) * charge as Float;
    let tan_lambda = momentum.z() / pt;
    let slope = (1.0 + tan_lambda * tan_lambda).sqrt();
    let phi_v = momentum.phi();
    let (sin_v, cos_v) = phi_v.sin_cos();
    let (x, y, z) = (position.x(), position.y(), position.z());

    if lambda.abs() < MIN_CURVATURE {
        // Straight line: the transverse poca is the projection of the vertex
        // onto the direction normal.
        let l_xy = -(x * cos_v + y * sin_v);
        let d0 = -(x + l_xy * cos_v) * sin_v + (y + l_xy * sin_v) * cos_v;
        return Ok(VertexPrediction {
            helix: HelixParameters {
                d0,
                phi0: phi_v,
                omega: 0.0,
                z0: z + l_xy * tan_lambda,
                tan_lambda,
            },
            flight_length: l_xy * slope,
        });
    }

    let omega = lambda / pt;
    // Transverse circle: a point with momentum azimuth phi sits at
    // center + (sin(phi), -cos(phi)) / omega.
    let xc = x - sin_v / omega;
    let yc = y + cos_v / omega;
    let rho = (xc * xc + yc * yc).sqrt();
    let radius = 1.0 / omega.abs();
    if rho < MIN_CURVATURE {
        // Circle centered on the z axis: every point is equidistant, take the
        // vertex itself as the poca.
        let d0 = -x * sin_v + y * cos_v;
        return Ok(VertexPrediction {
            helix: HelixParameters {
                d0,
                phi0: phi_v,
                omega,
                z0: z,
                tan_lambda,
            },
            flight_length: 0.0,
        });
    }
    let scale = 1.0 - radius / rho;
    let x_p = xc * scale;
    let y_p = yc * scale;
    let sin0 = omega * (x_p - xc);
    let cos0 = -omega * (y_p - yc);
    let phi0 = sin0.atan2(cos0);
    let d0 = -x_p * sin0 + y_p * cos0;
    let l_xy = wrap_angle(phi0 - phi_v) / omega;
    Ok(VertexPrediction {
        helix: HelixParameters {
            d0,
            phi0,
            omega,
            z0: z + l_xy * tan_lambda,
            tan_lambda,
        },
        flight_length: l_xy * slope,
    })
}

/// [`helix_from_vertex`] bundled with the Jacobian of its six outputs
/// `(d0, phi0, omega, z0, tan_lambda, flight_length)` with respect to the six
/// inputs `(x, y, z, px, py, pz)`, by central differences.
pub fn helix_from_vertex_jacobian(
    position: Vec3,
    momentum: Vec3,
    charge: i32,
    b_field: Float,
) -> FitResult<(VertexPrediction, SMatrix<Float, 6, 6>)> {
    let prediction = helix_from_vertex(position, momentum, charge, b_field)?;
    let eval = |v: &[Float; 6]| -> FitResult<[Float; 6]> {
        let p = helix_from_vertex(
            Vec3::new(v[0], v[1], v[2]),
            Vec3::new(v[3], v[4], v[5]),
            charge,
            b_field,
        )?;
        let h = p.helix;
        Ok([h.d0, h.phi0, h.omega, h.z0, h.tan_lambda, p.flight_length])
    };
    let x0 = [
        position.x(),
        position.y(),
        position.z(),
        momentum.x(),
        momentum.y(),
        momentum.z(),
    ];
    let mut jacobian = SMatrix::<Float, 6, 6>::zeros();
    for col in 0..6 {
        let step = Float::cbrt(Float::EPSILON) * (x0[col].abs() + 1.0);
        let mut lo = x0;
        lo[col] -= step;
        let mut hi = x0;
        hi[col] += step;
        let f_lo = eval(&lo)?;
        let f_hi = eval(&hi)?;
        for row in 0..6 {
            let diff = if row == 1 {
                wrap_angle(f_hi[row] - f_lo[row])
            } else {
                f_hi[row] - f_lo[row]
            };
            jacobian[(row, col)] = diff / (2.0 * step);
        }
    }
    Ok((prediction, jacobian))
}

/// Momentum at the perigee reconstructed from the helix parameters.
pub fn momentum_from_helix(
    helix: &HelixParameters,
    charge: i32,
    b_field: Float,
) -> FitResult<Vec3> {
    if helix.omega.abs() < MIN_CURVATURE {
        return Err(FitError::BadInput(
            "cannot recover a momentum scale from a straight helix".to_string(),
        ));
    }
    let pt = b_field_over_c(b_field) * charge as Float / helix.omega;
    if !(pt > 0.0) {
        return Err(FitError::BadInput(
            "helix curvature is inconsistent with the given charge".to_string(),
        ));
    }
    let (sin0, cos0) = helix.phi0.sin_cos();
    Ok(Vec3::new(pt * cos0, pt * sin0, pt * helix.tan_lambda))
}

/// Propagate the measured `(phi0, omega, tan_lambda)` covariance block into a
/// momentum covariance at the perigee.
pub fn momentum_covariance_from_helix(
    helix: &HelixParameters,
    covariance: &[[Float; 5]; 5],
    charge: i32,
    b_field: Float,
) -> FitResult<Matrix3<Float>> {
    let p = momentum_from_helix(helix, charge, b_field)?;
    // Columns: phi0, omega, tan_lambda (helix rows 1, 2, 4).
    let jac = Matrix3::new(
        -p.y(),
        -p.x() / helix.omega,
        0.0,
        p.x(),
        -p.y() / helix.omega,
        0.0,
        0.0,
        -p.z() / helix.omega,
        p.perp(),
    );
    let rows = [1, 2, 4];
    let mut block = Matrix3::zeros();
    for (i, &hi) in rows.iter().enumerate() {
        for (j, &hj) in rows.iter().enumerate() {
            block[(i, j)] = covariance[hi][hj];
        }
    }
    Ok(jac * block * jac.transpose())
}

/// Point of closest approach of two helices in the transverse plane, as a
/// vertex seed. Returns the signed 3D flight lengths from each perigee to the
/// returned point and the point itself, or `None` when the transverse circles
/// are degenerate.
pub fn poca_of_two_helices(
    first: &HelixParameters,
    second: &HelixParameters,
) -> Option<(Float, Float, Vec3)> {
    if first.omega.abs() < MIN_CURVATURE || second.omega.abs() < MIN_CURVATURE {
        return None;
    }
    let (x1, y1) = first.center();
    let (x2, y2) = second.center();
    let r1 = 1.0 / first.omega.abs();
    let r2 = 1.0 / second.omega.abs();
    let dx = x2 - x1;
    let dy = y2 - y1;
    let dist = (dx * dx + dy * dy).sqrt();
    if dist < MIN_CURVATURE {
        return None;
    }
    let ux = dx / dist;
    let uy = dy / dist;

    let along = (dist * dist + r1 * r1 - r2 * r2) / (2.0 * dist);
    let h2 = r1 * r1 - along * along;
    let candidates: Vec<(Float, Float)> = if h2 >= 0.0 {
        let h = h2.sqrt();
        let fx = x1 + along * ux;
        let fy = y1 + along * uy;
        vec![(fx - h * uy, fy + h * ux), (fx + h * uy, fy - h * ux)]
    } else if dist > r1 + r2 {
        // Disjoint circles: midpoint between the nearest rims.
        let px1 = x1 + r1 * ux;
        let py1 = y1 + r1 * uy;
        let px2 = x2 - r2 * ux;
        let py2 = y2 - r2 * uy;
        vec![(0.5 * (px1 + px2), 0.5 * (py1 + py2))]
    } else {
        // One circle inside the other.
        let px1 = x1 + r1 * ux;
        let py1 = y1 + r1 * uy;
        let px2 = x2 + r2 * ux;
        let py2 = y2 + r2 * uy;
        vec![(0.5 * (px1 + px2), 0.5 * (py1 + py2))]
    };

    let z_and_flight = |h: &HelixParameters, xc: Float, yc: Float, x: Float, y: Float| {
        let phi = (h.omega * (x - xc)).atan2(-h.omega * (y - yc));
        let l_xy = wrap_angle(phi - h.phi0) / h.omega;
        let z = h.z0 + l_xy * h.tan_lambda;
        let flight = l_xy * (1.0 + h.tan_lambda * h.tan_lambda).sqrt();
        (z, flight)
    };

    let mut best: Option<(Float, Float, Float, Vec3)> = None;
    for (x, y) in candidates {
        let (za, fa) = z_and_flight(first, x1, y1, x, y);
        let (zb, fb) = z_and_flight(second, x2, y2, x, y);
        let separation = (za - zb).abs();
        let point = Vec3::new(x, y, 0.5 * (za + zb));
        if best.as_ref().map_or(true, |b| separation < b.0) {
            best = Some((separation, fa, fb, point));
        }
    }
    best.map(|(_, fa, fb, point)| (fa, fb, point))
}
