/// Types implementing BeanstalkSerialisable have a canonical byte
/// rendering on the Beanstalk TCP connection, in either direction.
pub trait BeanstalkSerialisable {
    /// Converts the value in question to a Beanstalk command or response.
    fn serialise_beanstalk(&self) -> Vec<u8>;
}
