pub mod cdeerror;

pub mod configuration;

pub mod cde {
    pub mod vectorfield;
    pub mod cdedynamics;
    pub mod sensitivity;
    pub mod forwardintegrator;
    pub mod adjoint;
    pub mod directsensitivity;
    pub mod cdeint;
}

pub mod math {
    pub mod tridiagonal;

    pub mod interpolation {
        pub mod interpolant;
        pub mod observations;
        pub mod linearinterpolation;
        pub mod naturalcubicspline;
    }
}

pub mod solver {
    pub mod solveroptions;
    pub mod odesolver;
    pub mod rungekutta;
}
