/// Perigee helix geometry: prediction from a vertex, flight lengths, and the
/// point of closest approach of two helices.
pub mod helix;
/// The chi-square tail probability used for fit p-values.
pub mod stats;
/// Small kinematic vector types used outside the flat fit state.
pub mod vectors;
